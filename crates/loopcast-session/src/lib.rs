use std::fmt;

/// Caller-chosen identifier of one streaming channel.
///
/// NOTE: Opaque to the relay. It is only trimmed and checked for emptiness.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub String);

impl SlotId {
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        if s.is_empty() {
            None
        } else {
            Some(Self(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved push target: base URL and stream key joined with `/`.
#[derive(Clone, PartialEq, Eq)]
pub struct Destination(String);

impl Destination {
    pub fn resolve(url: &str, key: &str) -> Option<Self> {
        let url = url.trim();
        let key = key.trim();
        if url.is_empty() || key.is_empty() {
            return None;
        }
        // The target ends up as an encoder argument; NUL or line breaks never belong there.
        if url.chars().chain(key.chars()).any(char::is_control) {
            return None;
        }
        let url = url.strip_suffix('/').unwrap_or(url);
        Some(Self(format!("{url}/{key}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Destination with the stream key masked, safe for logs and API output.
    pub fn redacted(&self) -> String {
        match self.0.rsplit_once('/') {
            Some((base, _key)) => format!("{base}/<redacted>"),
            None => "<redacted>".to_string(),
        }
    }
}

// Keys are secrets; never print them by accident.
impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Destination").field(&self.redacted()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Running,
    Stopping,
    Exited,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(rename = "slotID")]
    pub slot_id: SlotId,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub source: String,
    pub destination: String,
    pub started_at_unix_ms: u64,
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_id_is_trimmed_and_non_empty() {
        assert_eq!(SlotId::parse("  s1 ").unwrap().as_str(), "s1");
        assert!(SlotId::parse("   ").is_none());
        assert!(SlotId::parse("").is_none());
    }

    #[test]
    fn destination_joins_trimmed_parts() {
        let d = Destination::resolve(" rtmp://a.example/live2 ", " abcd-1234\n").unwrap();
        assert_eq!(d.as_str(), "rtmp://a.example/live2/abcd-1234");
    }

    #[test]
    fn destination_does_not_double_separator() {
        let d = Destination::resolve("rtmp://a.example/live2/", "key").unwrap();
        assert_eq!(d.as_str(), "rtmp://a.example/live2/key");
    }

    #[test]
    fn destination_requires_both_parts() {
        assert!(Destination::resolve("rtmp://a.example/live2", "  ").is_none());
        assert!(Destination::resolve("", "key").is_none());
    }

    #[test]
    fn destination_rejects_control_characters() {
        assert!(Destination::resolve("rtmp://a.example/live2", "ke\0y").is_none());
        assert!(Destination::resolve("rtmp://a.example/\nlive2", "key").is_none());
        assert!(Destination::resolve("rtmp://a.example/live2", "k\tey").is_none());
    }

    #[test]
    fn destination_debug_hides_key() {
        let d = Destination::resolve("rtmp://a.example/live2", "secret-key").unwrap();
        let dbg = format!("{d:?}");
        assert!(!dbg.contains("secret-key"));
        assert_eq!(d.redacted(), "rtmp://a.example/live2/<redacted>");
    }

    #[test]
    fn status_serializes_slot_id_key() {
        let s = SessionStatus {
            slot_id: SlotId("s1".to_string()),
            state: SessionState::Running,
            pid: Some(42),
            source: "/data/videos/a.mp4".to_string(),
            destination: "rtmp://x/<redacted>".to_string(),
            started_at_unix_ms: 1,
            exit_code: None,
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["slotID"], "s1");
        assert_eq!(v["state"], "Running");
        assert_eq!(v["startedAtUnixMs"], 1);
    }
}
