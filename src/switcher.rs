use std::fmt;
use std::sync::Arc;

use stream_backend::BackendAdapter;

use crate::custom_command::CustomCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    Buffering,
    DecoderErrors,
}

impl fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchReason::Buffering => write!(f, "buffering"),
            SwitchReason::DecoderErrors => write!(f, "decoder errors"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// `display_name` is the name reported right after the switch, if the
    /// backend could be polled
    Switched { display_name: Option<String> },
    Failed,
}

impl SwitchOutcome {
    pub fn is_switched(&self) -> bool {
        matches!(self, SwitchOutcome::Switched { .. })
    }
}

/// Asks the backend to move a stream to its next source
pub struct Switcher {
    backend: Arc<dyn BackendAdapter>,
    custom_command: Option<CustomCommand>,
}

impl Switcher {
    pub fn new(backend: Arc<dyn BackendAdapter>, custom_command: Option<CustomCommand>) -> Self {
        Self {
            backend,
            custom_command,
        }
    }

    pub fn backend(&self) -> &Arc<dyn BackendAdapter> {
        &self.backend
    }

    pub async fn try_switch(&self, stream_id: &str, reason: SwitchReason) -> SwitchOutcome {
        if let Some(command) = &self.custom_command {
            command.fire(stream_id);
        }

        log::info!("[{}] Switching to next stream ({})", stream_id, reason);
        match self.backend.switch_to_next(stream_id).await {
            Ok(true) => {}
            Ok(false) => {
                log::error!(
                    "[{}] {} refused to switch to the next stream",
                    stream_id,
                    self.backend.backend_type()
                );
                return SwitchOutcome::Failed;
            }
            Err(e) => {
                log::error!("[{}] Failed to switch stream: {}", stream_id, e);
                return SwitchOutcome::Failed;
            }
        }

        let display_name = match self.backend.list_active_streams().await {
            Ok(streams) => streams
                .into_iter()
                .find(|stream| stream.id == stream_id)
                .map(|stream| stream.name),
            Err(e) => {
                log::warn!("[{}] Could not refresh name after switch: {}", stream_id, e);
                None
            }
        };
        match &display_name {
            Some(name) => log::info!("[{}] Switched stream, now playing {}", stream_id, name),
            None => log::info!("[{}] Switched stream", stream_id),
        }
        SwitchOutcome::Switched { display_name }
    }
}
