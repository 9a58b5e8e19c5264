//! Request/reply over a broker.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{EventError, EventResult};
use super::subscriber::Subscriber;
use super::{Broker, BrokerExt};

/// How long [`query`] waits for a reply by default.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// A request published on a service topic. Answers go to `reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub topic: String,
    pub reply: String,
    pub body: serde_json::Value,
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Publish `request` on `topic` and wait for a single response.
///
/// A private reply topic is subscribed for the duration of the call. Hitting
/// the timeout yields [`EventError::EndOfStream`]; an error string in the
/// response yields [`EventError::Remote`].
pub async fn query<Req, Resp>(
    broker: &dyn Broker,
    topic: &str,
    request: &Req,
    timeout: Duration,
) -> EventResult<Resp>
where
    Req: Serialize + ?Sized + Sync,
    Resp: DeserializeOwned,
{
    let reply = Uuid::new_v4().to_string();
    let sub = broker.subscribe(&reply).await?;

    let outcome = exchange(broker, &sub, topic, request, timeout).await;

    broker.unsubscribe(&sub).await?;
    outcome
}

async fn exchange<Req, Resp>(
    broker: &dyn Broker,
    sub: &Subscriber,
    topic: &str,
    request: &Req,
    timeout: Duration,
) -> EventResult<Resp>
where
    Req: Serialize + ?Sized + Sync,
    Resp: DeserializeOwned,
{
    let envelope = Request {
        topic: topic.to_string(),
        reply: sub.topic().to_string(),
        body: serde_json::to_value(request)?,
    };
    broker.publish(topic, &envelope).await?;

    let cancel = CancellationToken::new();
    let rsp = match tokio::time::timeout(timeout, next_response(sub, &cancel)).await {
        Ok(rsp) => rsp?,
        Err(_) => {
            log::debug!("Query on {} timed out after {:?}", topic, timeout);
            return Err(EventError::EndOfStream);
        }
    };

    if let Some(err) = rsp.error.filter(|e| !e.is_empty()) {
        return Err(EventError::Remote(err));
    }
    Ok(serde_json::from_value(rsp.body)?)
}

async fn next_response(sub: &Subscriber, cancel: &CancellationToken) -> EventResult<Response> {
    loop {
        if let Some(rsp) = sub.next::<Response>(cancel).await? {
            return Ok(rsp);
        }
    }
}

/// Answer a [`Request`] received on a service topic.
pub async fn respond<T: Serialize>(
    broker: &dyn Broker,
    request: &Request,
    result: Result<T, String>,
) -> EventResult<()> {
    let response = match result {
        Ok(body) => Response {
            body: serde_json::to_value(body)?,
            error: None,
        },
        Err(error) => Response {
            body: serde_json::Value::Null,
            error: Some(error),
        },
    };
    broker.publish(&request.reply, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemoryBroker;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sum {
        a: i64,
        b: i64,
    }

    /// Answers sums on "adder" until cancelled.
    async fn spawn_adder(broker: Arc<dyn Broker>, fail: bool) -> CancellationToken {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let sub = broker.subscribe("adder").await.unwrap();
        tokio::spawn(async move {
            while let Ok(next) = sub.next::<Request>(&token).await {
                let Some(req) = next else { continue };
                let sum: Sum = serde_json::from_value(req.body.clone()).unwrap();
                let result = if fail {
                    Err("adder offline".to_string())
                } else {
                    Ok(sum.a + sum.b)
                };
                respond(broker.as_ref(), &req, result).await.unwrap();
            }
        });
        stop
    }

    #[tokio::test]
    async fn test_query_round_trip() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let stop = spawn_adder(broker.clone(), false).await;

        let total: i64 = query(
            broker.as_ref(),
            "adder",
            &Sum { a: 2, b: 40 },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(total, 42);
        stop.cancel();
    }

    #[tokio::test]
    async fn test_query_surfaces_remote_error() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let stop = spawn_adder(broker.clone(), true).await;

        let result: EventResult<i64> = query(
            broker.as_ref(),
            "adder",
            &Sum { a: 1, b: 1 },
            Duration::from_secs(1),
        )
        .await;
        match result {
            Err(EventError::Remote(msg)) => assert_eq!(msg, "adder offline"),
            other => panic!("expected remote error, got {other:?}"),
        }
        stop.cancel();
    }

    #[tokio::test]
    async fn test_query_times_out_without_responder() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());

        let result: EventResult<i64> = query(
            broker.as_ref(),
            "nobody-home",
            &Sum { a: 1, b: 2 },
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(result, Err(EventError::EndOfStream)));
    }
}
