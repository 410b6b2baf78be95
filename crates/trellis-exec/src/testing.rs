use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use trellis_core::{ArtifactCreator, ArtifactSpec, CreateContext, Result, TrellisError};

/// Creator stub: deterministic output per spec, records every call and
/// the dependency outputs it was handed, and can be told to fail for
/// chosen artifact ids.
pub(crate) struct RecordingCreator {
    pub created: Mutex<Vec<String>>,
    pub contexts: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    fail_on: Mutex<BTreeSet<String>>,
    fail_all: bool,
}

pub(crate) fn recording_creator() -> Arc<RecordingCreator> {
    Arc::new(RecordingCreator {
        created: Mutex::new(Vec::new()),
        contexts: Mutex::new(BTreeMap::new()),
        fail_on: Mutex::new(BTreeSet::new()),
        fail_all: false,
    })
}

pub(crate) fn failing_creator() -> Arc<RecordingCreator> {
    Arc::new(RecordingCreator {
        created: Mutex::new(Vec::new()),
        contexts: Mutex::new(BTreeMap::new()),
        fail_on: Mutex::new(BTreeSet::new()),
        fail_all: true,
    })
}

impl RecordingCreator {
    pub fn failing_on(self: Arc<Self>, id: &str) -> Arc<Self> {
        self.fail_on.lock().unwrap().insert(id.to_string());
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl ArtifactCreator for RecordingCreator {
    fn create(&self, spec: &ArtifactSpec, ctx: &CreateContext) -> BoxFuture<'_, Result<String>> {
        self.created.lock().unwrap().push(spec.id.clone());
        self.contexts
            .lock()
            .unwrap()
            .insert(spec.id.clone(), ctx.completed.clone());

        let fail = self.fail_all || self.fail_on.lock().unwrap().contains(&spec.id);
        let outcome = if fail {
            Err(TrellisError::ArtifactExecution {
                artifact: spec.id.clone(),
                message: "scripted failure".to_string(),
            })
        } else {
            // Output is a pure function of the spec, so content hashes
            // are stable across runs until the spec changes.
            Ok(format!("{}|{}", spec.description, spec.contract))
        };
        Box::pin(async move { outcome })
    }
}
