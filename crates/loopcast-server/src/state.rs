use loopcast_agent::SessionRegistry;

use crate::storage::VideoStore;

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub store: VideoStore,
    /// Result of the boot-time `<encoder> -version` probe.
    pub encoder_available: bool,
}
