use std::sync::Arc;

use auto_react::testing::FakeConnector;

use crate::AppState;
use crate::config::{AutoReactConfig, FileConfig, ServerConfig};

/// A wired `AppState` plus the fake gateway behind it.
///
/// Hold the whole struct for the lifetime of the test so the temporary
/// credential directory stays valid.
pub struct TestApp {
    pub state: AppState,
    pub connector: Arc<FakeConnector>,
    _tmp: tempfile::TempDir,
}

/// Build an `AppState` with default configuration over a [`FakeConnector`]
/// and a temporary data directory.
pub async fn test_app_state() -> TestApp {
    let config = ServerConfig::from_file(&FileConfig::default()).expect("default config");
    test_app_state_with(config).await
}

pub async fn test_app_state_with(server_config: ServerConfig) -> TestApp {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = AutoReactConfig::new(Some(tmp.path().to_path_buf())).expect("config");
    let connector = Arc::new(FakeConnector::new());

    let state = AppState::new(server_config, &config, connector.clone());
    TestApp {
        state,
        connector,
        _tmp: tmp,
    }
}
