use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use trellis_core::{GenerateOptions, ModelClient, Result, TrellisError};

/// Model stub that replays scripted responses in call order and records
/// every prompt it was given.
pub(crate) struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    repeat: Option<String>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            repeat: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the same response.
    pub fn repeating(response: &str) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            repeat: Some(response.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Fails every call.
    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl ModelClient for ScriptedModel {
    fn generate(&self, prompt: &str, _options: &GenerateOptions) -> BoxFuture<'_, Result<String>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone());
        Box::pin(async move {
            next.ok_or_else(|| TrellisError::ModelRequest("scripted responses exhausted".to_string()))
        })
    }
}
