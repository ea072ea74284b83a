use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

pub mod classifier;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::{Child, ChildStderr};

use crate::config::Config;
use crate::errors::WatchdogError;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;
#[cfg(target_os = "windows")]
#[allow(unused_imports)]
use std::os::windows::process::CommandExt;

/// Builds and spawns the ffmpeg probes that pull a stream and throw the
/// decoded output away.
#[derive(Debug, Clone)]
pub struct ProbeLauncher {
    ffmpeg_path: PathBuf,
    user_agent: String,
    /// Decode every frame so decoder errors surface; otherwise only remux
    decode_frames: bool,
}

impl ProbeLauncher {
    pub fn new(ffmpeg_path: PathBuf, user_agent: &str, decode_frames: bool) -> Self {
        Self {
            ffmpeg_path,
            user_agent: user_agent.to_string(),
            decode_frames,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ffmpeg_path.clone(),
            &config.user_agent,
            config.error_detection_enabled(),
        )
    }

    pub fn args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<&str> = vec![
            "-hide_banner",
            "-nostats",
            "-user_agent",
            self.user_agent.as_str(),
            "-fflags",
            "+nobuffer+discardcorrupt",
            "-flags",
            "low_delay",
            "-rtbufsize",
            "10M",
            "-i",
            url,
        ];
        if self.decode_frames {
            args.extend([
                "-fflags",
                "nobuffer",
                "-flags",
                "low_delay",
                "-max_muxing_queue_size",
                "512",
            ]);
        } else {
            args.extend(["-c", "copy"]);
        }
        // progress records (speed=...) go to stderr, one key per line
        args.extend(["-progress", "pipe:2", "-f", "null", "-"]);
        args.into_iter().map(str::to_string).collect()
    }

    /// Start a probe. The caller owns both the process and its diagnostic stream.
    pub fn spawn(
        &self,
        stream_id: &str,
        url: &str,
    ) -> Result<(ProbeProcess, ChildStderr), WatchdogError> {
        let mut ffmpeg_process = tokio::process::Command::new(&self.ffmpeg_path);
        #[cfg(target_os = "windows")]
        ffmpeg_process.creation_flags(CREATE_NO_WINDOW);

        let mut child = ffmpeg_process
            .args(self.args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WatchdogError::Spawn {
                stream_id: stream_id.to_string(),
                source,
            })?;

        let Some(stderr) = child.stderr.take() else {
            // Unreachable with Stdio::piped(), but never leave the child behind
            let _ = child.start_kill();
            return Err(WatchdogError::Spawn {
                stream_id: stream_id.to_string(),
                source: std::io::Error::other("probe stderr was not captured"),
            });
        };

        log::debug!(
            "[{}] Spawned {} (pid {:?})",
            stream_id,
            self.ffmpeg_path.display(),
            child.id()
        );
        Ok((
            ProbeProcess {
                stream_id: stream_id.to_string(),
                child,
            },
            stderr,
        ))
    }
}

/// An ffmpeg probe owned by exactly one supervised stream
#[derive(Debug)]
pub struct ProbeProcess {
    stream_id: String,
    child: Child,
}

impl ProbeProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate gracefully, escalating to a kill after `grace`.
    ///
    /// Always reaps the child. Stopping a probe that already exited is a no-op.
    pub async fn stop(&mut self, grace: Duration) {
        match self.child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                log::warn!("[{}] Failed to query probe status: {}", self.stream_id, e);
            }
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid as UnixPid;

            if let Err(e) = kill(UnixPid::from_raw(pid as i32), Signal::SIGTERM) {
                log::debug!("[{}] SIGTERM failed: {}", self.stream_id, e);
            }
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => {
                    log::warn!("[{}] Waiting for probe failed: {}", self.stream_id, e);
                }
                Err(_) => {
                    log::warn!(
                        "[{}] ffmpeg did not terminate within {:?}, forcing stop",
                        self.stream_id,
                        grace
                    );
                }
            }
        }
        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = self.child.kill().await {
            // kill() fails only when the child is already gone
            log::debug!("[{}] Kill after grace period: {}", self.stream_id, e);
        }
    }

    /// Resident memory of the probe, `None` when it cannot be measured
    /// (already exited, access denied).
    pub fn memory_bytes(&mut self, system: &mut System) -> Option<u64> {
        if self.has_exited() {
            return None;
        }
        let pid = Pid::from_u32(self.pid()?);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|process| process.memory())
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::OnceLock;

    fn write_script(body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ffmpeg");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.sync_all().unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    /// A stand-in for ffmpeg that ignores its arguments and idles until killed.
    pub(crate) fn fake_ffmpeg() -> PathBuf {
        static SCRIPT: OnceLock<tempfile::TempDir> = OnceLock::new();
        SCRIPT
            .get_or_init(|| write_script("#!/bin/sh\nexec sleep 30\n"))
            .path()
            .join("ffmpeg")
    }

    /// Like [`fake_ffmpeg`] but ignores SIGTERM, so only a kill stops it.
    fn stubborn_ffmpeg() -> PathBuf {
        static SCRIPT: OnceLock<tempfile::TempDir> = OnceLock::new();
        SCRIPT
            .get_or_init(|| write_script("#!/bin/sh\ntrap '' TERM\nwhile :; do sleep 1; done\n"))
            .path()
            .join("ffmpeg")
    }

    #[test]
    fn test_copy_mode_args() {
        let launcher = ProbeLauncher::new(PathBuf::from("ffmpeg"), "Buffer Watchdog", false);
        let args = launcher.args("http://sm:7095/v/0/12");
        let joined = args.join(" ");
        assert!(joined.contains("-user_agent Buffer Watchdog"));
        assert!(joined.contains("-i http://sm:7095/v/0/12 -c copy"));
        assert!(joined.ends_with("-progress pipe:2 -f null -"));
        assert!(!joined.contains("max_muxing_queue_size"));
    }

    #[test]
    fn test_decode_mode_args() {
        let launcher = ProbeLauncher::new(PathBuf::from("ffmpeg"), "Buffer Watchdog", true);
        let args = launcher.args("http://sm:7095/v/0/12");
        assert!(args.iter().any(|a| a == "-max_muxing_queue_size"));
        assert!(!args.iter().any(|a| a == "copy"));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let launcher = ProbeLauncher::new(
            PathBuf::from("/nonexistent/bin/ffmpeg"),
            "Buffer Watchdog",
            false,
        );
        let result = launcher.spawn("12", "http://sm:7095/v/0/12");
        assert!(matches!(result, Err(WatchdogError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_stop_reaps_and_is_idempotent() {
        let launcher = ProbeLauncher::new(fake_ffmpeg(), "Buffer Watchdog", false);
        let (mut probe, _stderr) = launcher.spawn("12", "http://sm:7095/v/0/12").unwrap();
        assert!(!probe.has_exited());

        probe.stop(Duration::from_secs(2)).await;
        assert!(probe.has_exited());
        assert_eq!(probe.pid(), None);

        // second stop must not error or block
        probe.stop(Duration::from_secs(2)).await;
        assert!(probe.has_exited());
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace_period() {
        let launcher = ProbeLauncher::new(stubborn_ffmpeg(), "Buffer Watchdog", false);
        let (mut process, _stderr) = launcher.spawn("12", "http://sm:7095/v/0/12").unwrap();
        // let the shell install its trap before signalling
        tokio::time::sleep(Duration::from_millis(300)).await;

        let grace = Duration::from_millis(500);
        let started = std::time::Instant::now();
        process.stop(grace).await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(450), "stopped after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "stopped after {elapsed:?}");
        assert!(process.has_exited());
        assert_eq!(process.pid(), None);
    }

    #[tokio::test]
    async fn test_spawn_resolves_bare_program_name() {
        // a bare name is looked up through PATH like any other command
        let launcher = ProbeLauncher::new(PathBuf::from("sh"), "Buffer Watchdog", false);
        let (mut process, _stderr) = launcher.spawn("12", "http://sm:7095/v/0/12").unwrap();
        process.stop(Duration::from_secs(2)).await;
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_memory_of_exited_probe_is_unknown() {
        let launcher = ProbeLauncher::new(fake_ffmpeg(), "Buffer Watchdog", false);
        let (mut probe, _stderr) = launcher.spawn("12", "http://sm:7095/v/0/12").unwrap();
        let mut system = System::new();
        probe.stop(Duration::from_secs(2)).await;
        assert_eq!(probe.memory_bytes(&mut system), None);
    }
}
