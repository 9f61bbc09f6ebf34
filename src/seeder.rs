//! Nested container engine pre-seeder.
//!
//! Pulling module images on the host engine would record host-architecture
//! manifests in the shared content store. Instead a throwaway
//! engine-in-container runs with the target root's docker directory bound as
//! its data root, and every pull goes through it with the target platform
//! pinned, so the layers that land on the card are the target's layers.

use anyhow::Result;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::board::ModuleImageRef;
use crate::errors::BuildError;
use crate::process::{Cmd, SharedRunner};

const DIND_IMAGE: &str = "docker:24-dind";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct EnginePreseeder {
    name: String,
    endpoint: String,
    runner: SharedRunner,
    running: bool,
    ready_timeout: Duration,
}

impl EnginePreseeder {
    pub fn new(runner: SharedRunner) -> Self {
        let pid = std::process::id();
        Self {
            name: format!("dt-disk-builder-engine-{pid}"),
            endpoint: format!("tcp://127.0.0.1:{}", 2375 + (pid % 1000) as u16),
            runner,
            running: false,
            ready_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Start the nested engine with `data_root` (the target's
    /// `var/lib/docker`) bound as its storage tree.
    pub fn start(&mut self, data_root: &Path) -> Result<()> {
        let port = self
            .endpoint
            .rsplit(':')
            .next()
            .unwrap_or("2375")
            .to_string();
        Cmd::new(self.runner.as_ref(), "docker")
            .args(["run", "-d", "--privileged", "--name", &self.name])
            .args(["-e", "DOCKER_TLS_CERTDIR="])
            .arg("-v")
            .arg(&format!("{}:/var/lib/docker", data_root.display()))
            .args(["-p", &format!("127.0.0.1:{port}:2375")])
            .arg(DIND_IMAGE)
            .args(["dockerd", "--host=tcp://0.0.0.0:2375"])
            .error_msg("starting nested container engine failed")
            .run()?;
        self.running = true;
        println!("  nested engine '{}' listening on {}", self.name, self.endpoint);
        Ok(())
    }

    /// Poll the engine's TCP control endpoint until it answers, bounded.
    pub fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            let probe = Cmd::new(self.runner.as_ref(), "docker")
                .args(["-H", &self.endpoint, "version"])
                .allow_fail()
                .run()?;
            if probe.success() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BuildError::ExternalTool {
                    command: format!("docker -H {} version", self.endpoint),
                    status: probe.status,
                    detail: format!(
                        "nested engine not reachable within {:?}: {}",
                        self.ready_timeout,
                        probe.stderr_str()
                    ),
                }
                .into());
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
    }

    /// Pull one module image into the nested engine for the target platform.
    pub fn pull(&self, module: &ModuleImageRef, arch: &str) -> Result<()> {
        let reference = module.reference();
        println!("  pulling {reference} (linux/{arch})");
        Cmd::new(self.runner.as_ref(), "docker")
            .args(["-H", &self.endpoint, "pull"])
            .args(["--platform", &format!("linux/{arch}")])
            .arg(&reference)
            .error_msg(&format!("pulling '{reference}' failed"))
            .run()?;
        Ok(())
    }

    /// Pull the whole module set. The engine is torn down afterwards on both
    /// success and failure paths.
    pub fn seed(&mut self, data_root: &Path, modules: &[ModuleImageRef], arch: &str) -> Result<()> {
        self.start(data_root)?;
        let result = (|| -> Result<()> {
            self.wait_ready()?;
            for module in modules {
                self.pull(module, arch)?;
            }
            Ok(())
        })();
        self.stop();
        result
    }

    /// Remove the nested engine container. Suppressible: cleanup path.
    pub fn stop(&mut self) {
        if self.running {
            let _ = Cmd::new(self.runner.as_ref(), "docker")
                .args(["rm", "-f", &self.name])
                .allow_fail()
                .run();
            self.running = false;
        }
    }
}

impl Drop for EnginePreseeder {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::RecordingRunner;
    use std::sync::Arc;

    fn modules() -> Vec<ModuleImageRef> {
        vec![
            ModuleImageRef::new("docker.io", "duckietown", "dt-device-health", "ente-arm64v8"),
            ModuleImageRef::new("docker.io", "duckietown", "dt-files-api", "ente-arm64v8"),
        ]
    }

    #[test]
    fn seed_pulls_every_module_with_platform_and_stops_engine() {
        let runner = Arc::new(RecordingRunner::new());
        let mut seeder = EnginePreseeder::new(runner.clone())
            .with_ready_timeout(Duration::from_millis(10));

        seeder
            .seed(Path::new("/mnt/rootfs/var/lib/docker"), &modules(), "arm64v8")
            .unwrap();

        let calls = runner.calls();
        assert!(calls[0].contains("docker run -d --privileged"));
        assert!(calls[0].contains("/mnt/rootfs/var/lib/docker:/var/lib/docker"));
        assert!(calls[1].contains("version"));
        assert!(calls[2].contains("pull --platform linux/arm64v8"));
        assert!(calls[2].contains("docker.io/duckietown/dt-device-health:ente-arm64v8"));
        assert!(calls[3].contains("dt-files-api"));
        assert!(calls.last().unwrap().contains("rm -f"));
    }

    #[test]
    fn failed_pull_still_tears_down_engine() {
        let runner = Arc::new(RecordingRunner::new());
        runner.push_stdout("abc123"); // docker run
        runner.push_stdout("24.0"); // version probe
        runner.push_failure(1, "manifest unknown"); // first pull fails

        let mut seeder = EnginePreseeder::new(runner.clone())
            .with_ready_timeout(Duration::from_millis(10));
        let err = seeder
            .seed(Path::new("/mnt/root/var/lib/docker"), &modules(), "arm64v8")
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ExternalTool { .. })
        ));
        assert!(runner.calls().last().unwrap().contains("rm -f"));
    }

    #[test]
    fn wait_ready_times_out() {
        let runner = Arc::new(RecordingRunner::new());
        runner.push_failure(1, "connection refused");

        let seeder =
            EnginePreseeder::new(runner).with_ready_timeout(Duration::from_millis(0));
        assert!(seeder.wait_ready().is_err());
    }
}
