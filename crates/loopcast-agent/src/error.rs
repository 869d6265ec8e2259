use loopcast_session::SlotId;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Validation(String),

    #[error("slot already streaming: {0}")]
    Conflict(SlotId),

    #[error("{0}")]
    NotFound(String),

    #[error("{message}")]
    Process {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl SessionError {
    pub fn process(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Process {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn process_msg(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
            source: None,
        }
    }

    pub fn slot_not_active(slot_id: &SlotId) -> Self {
        Self::NotFound(format!("slot not active: {slot_id}"))
    }

    /// Stable machine-readable code, mirrored into HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_param",
            Self::Conflict(_) => "slot_busy",
            Self::NotFound(_) => "not_found",
            Self::Process { .. } => "process_failed",
        }
    }
}
