use std::sync::Arc;

use crate::{auth::AuthConfig, hub::ChatHub};
use server_api::ApiContext;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: Arc<ChatHub>,
    pub(crate) auth: AuthConfig,
}
