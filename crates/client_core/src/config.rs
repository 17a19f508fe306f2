use std::{fs, io::ErrorKind, path::Path, time::Duration};

use anyhow::{bail, Context};
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::push::ReconnectPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "controller.toml";
pub const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_base_url: Url,
    pub ws_url: Url,
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

/// Values given on the command line; they beat both file and environment.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    ws_url: Option<String>,
    request_timeout_ms: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    reconnect_multiplier: Option<f64>,
}

/// Loads `path`, or `controller.toml` in the working directory when it
/// exists, then applies environment and command-line overrides.
pub fn load_settings(
    path: Option<&Path>,
    overrides: &SettingsOverrides,
) -> anyhow::Result<ClientSettings> {
    let explicit = path.is_some();
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    let contents = match fs::read_to_string(path) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == ErrorKind::NotFound && !explicit => None,
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    };
    load_settings_from(contents.as_deref(), |key| std::env::var(key).ok(), overrides)
}

pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
    overrides: &SettingsOverrides,
) -> anyhow::Result<ClientSettings> {
    let file = match file_contents {
        Some(raw) => toml::from_str::<FileSettings>(raw).context("invalid controller config")?,
        None => FileSettings::default(),
    };

    let api_url = overrides
        .api_url
        .clone()
        .or_else(|| env("APP__API_URL"))
        .or_else(|| env("CONTROLLER_API_URL"))
        .or(file.api_url);
    let api_base_url = match api_url {
        Some(raw) => parse_with_scheme(&raw, &["http", "https"])?,
        None => Url::parse(DEFAULT_API_URL)?,
    };

    let ws_url = overrides
        .ws_url
        .clone()
        .or_else(|| env("APP__WS_URL"))
        .or_else(|| env("CONTROLLER_WS_URL"))
        .or(file.ws_url);
    let ws_url = match ws_url {
        Some(raw) => parse_with_scheme(&raw, &["ws", "wss"])?,
        None => derive_ws_url(&api_base_url)?,
    };

    let mut settings = ClientSettings {
        api_base_url,
        ws_url,
        request_timeout: DEFAULT_REQUEST_TIMEOUT,
        reconnect: ReconnectPolicy::default(),
    };

    if let Some(ms) = env_millis(&env, "APP__REQUEST_TIMEOUT_MS").or(file.request_timeout_ms) {
        settings.request_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = env_millis(&env, "APP__RECONNECT_INITIAL_MS").or(file.reconnect_initial_ms) {
        settings.reconnect.initial = Duration::from_millis(ms);
    }
    if let Some(ms) = env_millis(&env, "APP__RECONNECT_MAX_MS").or(file.reconnect_max_ms) {
        settings.reconnect.max = Duration::from_millis(ms);
    }
    if let Some(multiplier) = file.reconnect_multiplier {
        settings.reconnect.multiplier = multiplier;
    }
    if settings.reconnect.max < settings.reconnect.initial {
        settings.reconnect.max = settings.reconnect.initial;
    }

    Ok(settings)
}

/// `http://host:port/prefix` becomes `ws://host:port/prefix/ws`.
pub fn derive_ws_url(api_base_url: &Url) -> anyhow::Result<Url> {
    let scheme = match api_base_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => bail!("cannot derive a websocket url from scheme '{other}'"),
    };
    let mut ws_url = api_base_url.clone();
    if ws_url.set_scheme(scheme).is_err() {
        bail!("cannot derive a websocket url from '{api_base_url}'");
    }
    ws_url.set_query(None);
    ws_url.set_fragment(None);
    ws_url
        .path_segments_mut()
        .map_err(|_| anyhow::anyhow!("'{api_base_url}' cannot be a base url"))?
        .pop_if_empty()
        .push("ws");
    Ok(ws_url)
}

fn parse_with_scheme(raw: &str, schemes: &[&str]) -> anyhow::Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("invalid url '{raw}'"))?;
    if !schemes.contains(&url.scheme()) {
        bail!(
            "url '{raw}' must use one of the schemes: {}",
            schemes.join(", ")
        );
    }
    Ok(url)
}

fn env_millis(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = env(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring non-numeric value");
            None
        }
    }
}
