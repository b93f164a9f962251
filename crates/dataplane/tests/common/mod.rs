//! In-memory container engine shared by the integration tests.
//!
//! Containers "run" the identity function: the function host echoes
//! `INPUT_DATA` back as the result, in the host's JSON output format.

#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use faas_dataplane::engine::{ContainerEngine, ContainerOutput, ContainerSpec, ExecOutput};

#[derive(Default)]
pub struct EchoEngine {
    specs: Mutex<HashMap<String, ContainerSpec>>,
    running: Mutex<HashSet<String>>,
    removed: Mutex<Vec<String>>,
    pub created: AtomicUsize,
    pub execs: AtomicUsize,
    pub runtimes: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

impl EchoEngine {
    pub fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    pub fn spec(&self, id: &str) -> Option<ContainerSpec> {
        self.specs.lock().unwrap().get(id).cloned()
    }

    fn echo(env: &[(String, String)]) -> String {
        let input = env
            .iter()
            .find(|(k, _)| k == "INPUT_DATA")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| "{}".to_string());
        let result: serde_json::Value = serde_json::from_str(&input).unwrap_or_default();
        serde_json::json!({"status": "success", "result": result, "execution_time": 0.001})
            .to_string()
    }
}

#[async_trait]
impl ContainerEngine for EchoEngine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_image(&self, _image: &str) -> Result<()> {
        Ok(())
    }

    async fn create(&self, spec: ContainerSpec) -> Result<String> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let id = format!("echo-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.specs.lock().unwrap().insert(id.clone(), spec);
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.running.lock().unwrap().insert(id.to_string());
        Ok(())
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.running.lock().unwrap().contains(id))
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.running.lock().unwrap().remove(id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.running.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn copy_file(
        &self,
        _id: &str,
        _dir: &str,
        _file_name: &str,
        _contents: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _id: &str,
        _cmd: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<ExecOutput> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        Ok(ExecOutput {
            stdout: Self::echo(&env),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn wait(&self, id: &str) -> Result<ContainerOutput> {
        let env = self
            .spec(id)
            .map(|spec| spec.env)
            .unwrap_or_default();
        self.running.lock().unwrap().remove(id);
        Ok(ContainerOutput {
            exit_code: 0,
            stdout: Self::echo(&env),
            stderr: String::new(),
        })
    }

    async fn runtimes(&self) -> Result<Vec<String>> {
        Ok(self.runtimes.lock().unwrap().clone())
    }

    async fn list_managed(&self) -> Result<Vec<String>> {
        Ok(self.running.lock().unwrap().iter().cloned().collect())
    }
}
