//! Demo plugin exercising the session variable API: on each request, reads a named session
//! variable (creating a session if none exists) and echoes it back alongside its prior value.

use std::sync::Arc;

use async_trait::async_trait;
use http::{header, StatusCode};
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

use crate::proxy::ProxyContext;
use crate::session;
use crate::utils::request::{get_client_ip, get_req_header_value};

use super::ProxyPlugin;

pub const PLUGIN_NAME: &str = "session_vars";

pub fn create_session_vars_plugin(cfg: YamlValue) -> Result<Arc<dyn ProxyPlugin>> {
    let config: PluginConfig = serde_yaml::from_value(cfg)
        .or_err_with(ReadError, || "Invalid session_vars plugin config")?;
    Ok(Arc::new(PluginSessionVars { config }))
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct PluginConfig {
    /// Session variable to read and increment.
    var: String,
}

pub struct PluginSessionVars {
    config: PluginConfig,
}

#[async_trait]
impl ProxyPlugin for PluginSessionVars {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn priority(&self) -> i32 {
        400
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let client_ip = get_client_ip(session);
        let cookie_header = get_req_header_value(session.req_header(), "Cookie").map(str::to_string);

        let manager = session::manager();
        manager.get_session(ctx, &client_ip, cookie_header.as_deref(), true)?;
        let without_ip = manager.session_without_ip();

        let previous = session::get_session_var(ctx, &self.config.var, "0", without_ip);
        let next = previous.parse::<u64>().unwrap_or(0) + 1;
        session::set_session_var(ctx, &self.config.var, &next.to_string(), without_ip)?;

        let body = format!("{}={}\n", self.config.var, next);
        let mut resp = ResponseHeader::build(StatusCode::OK, Some(2))?;
        resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;

        session.write_response_header(Box::new(resp), false).await?;
        session.write_response_body(Some(body.into()), true).await?;

        Ok(true)
    }
}
