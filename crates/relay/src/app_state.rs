use server_api::ApiContext;

use crate::rooms::RoomMultiplexer;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) rooms: RoomMultiplexer,
    pub(crate) public_url: Option<String>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext, public_url: Option<String>) -> Self {
        Self {
            api,
            rooms: RoomMultiplexer::default(),
            public_url: public_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
        }
    }

    /// Absolute form of a relay-relative path when a public URL is configured.
    pub(crate) fn public_link(&self, path: &str) -> String {
        match &self.public_url {
            Some(base) => format!("{base}{path}"),
            None => path.to_string(),
        }
    }
}
