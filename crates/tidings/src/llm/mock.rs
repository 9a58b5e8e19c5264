//! Scripted completion engine for tests and offline runs.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use log::warn;

use super::error::{LlmError, LlmResult};
use super::{CompletionModel, FragmentStream};
use crate::context::ContextWindow;

enum Script {
    /// Always answer with these fragments.
    Fixed(Vec<String>),
    /// Answer `echo: <prompt>`, one word per fragment.
    Echo,
    /// Fail before producing anything.
    Fail,
    /// Stream these fragments, then lose the upstream connection.
    CutOff(Vec<String>),
}

/// A prompt the mock was asked to answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub prompt: String,
    pub user: String,
    pub context: ContextWindow,
}

pub struct MockModel {
    name: String,
    script: Script,
    calls: Mutex<Vec<MockCall>>,
}

impl MockModel {
    pub fn new<I, S>(name: &str, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(
            name,
            Script::Fixed(fragments.into_iter().map(Into::into).collect()),
        )
    }

    pub fn echo(name: &str) -> Self {
        Self::with_script(name, Script::Echo)
    }

    pub fn failing(name: &str) -> Self {
        Self::with_script(name, Script::Fail)
    }

    /// A model whose stream breaks off after `fragments`.
    pub fn cut_off<I, S>(name: &str, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(
            name,
            Script::CutOff(fragments.into_iter().map(Into::into).collect()),
        )
    }

    fn with_script(name: &str, script: Script) -> Self {
        Self {
            name: name.to_string(),
            script,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn answer(&self, prompt: &str, user: &str, context: &ContextWindow) -> LlmResult<Vec<String>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(MockCall {
                prompt: prompt.to_string(),
                user: user.to_string(),
                context: context.clone(),
            });
        }

        match &self.script {
            Script::Fixed(fragments) => Ok(fragments.clone()),
            Script::Echo => Ok(format!("echo: {prompt}")
                .split_inclusive(' ')
                .map(str::to_string)
                .collect()),
            Script::Fail => Err(LlmError::Stream(format!("{} is unavailable", self.name))),
            Script::CutOff(fragments) => Ok(fragments.clone()),
        }
    }
}

#[async_trait]
impl CompletionModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        user: &str,
        context: &ContextWindow,
    ) -> LlmResult<String> {
        let reply = self.answer(prompt, user, context)?.concat();
        if let Script::CutOff(_) = self.script {
            return Err(LlmError::Stream(format!("{} dropped the connection", self.name)));
        }
        Ok(reply)
    }

    async fn stream(
        &self,
        prompt: &str,
        user: &str,
        context: &ContextWindow,
    ) -> LlmResult<FragmentStream> {
        let fragments = self.answer(prompt, user, context)?;
        let stream = futures::stream::iter(fragments);
        if let Script::CutOff(_) = self.script {
            let name = self.name.clone();
            // Upstream errors end the fragment stream early.
            let broken = futures::stream::once(async move {
                warn!("Error in completion stream for {}: connection reset", name);
            })
            .filter_map(|()| async { None::<String> });
            return Ok(Box::pin(stream.chain(broken)));
        }
        Ok(Box::pin(stream))
    }
}
