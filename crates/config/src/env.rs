//! `ACME_*` and `SELF_SIGNED_*` environment overrides.

use serde::Deserialize;
use tracing::debug;

use crate::acme::{AcmeConfig, ExternalAccountConfig};
use crate::self_signed::SelfSignedConfig;
use crate::ConfigError;

/// Environment prefix for ACME overrides
pub const ACME_ENV_PREFIX: &str = "ACME_";

/// Environment prefix for self-signed overrides
pub const SELF_SIGNED_ENV_PREFIX: &str = "SELF_SIGNED_";

#[derive(Debug, Default, Deserialize)]
struct AcmeEnv {
    email: Option<String>,
    directory_url: Option<String>,
    external_account_id: Option<String>,
    external_account_key: Option<String>,
    max_sanity_check_tries: Option<u32>,
    sanity_check_interval: Option<u64>,
}

/// Apply `ACME_*` variables from the process environment.
pub fn apply_acme_env(config: &mut AcmeConfig) -> Result<(), ConfigError> {
    let env: AcmeEnv = envy::prefixed(ACME_ENV_PREFIX).from_env()?;
    apply(config, env);
    Ok(())
}

/// Apply `ACME_*` variables from an explicit set of pairs.
pub fn apply_acme_vars<I>(config: &mut AcmeConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let env: AcmeEnv = envy::prefixed(ACME_ENV_PREFIX).from_iter(vars)?;
    apply(config, env);
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct SelfSignedEnv {
    ca: Option<String>,
    ca_private_key: Option<String>,
    validity_days: Option<u32>,
}

/// Apply `SELF_SIGNED_*` variables from the process environment.
pub fn apply_self_signed_env(config: &mut SelfSignedConfig) -> Result<(), ConfigError> {
    let env: SelfSignedEnv = envy::prefixed(SELF_SIGNED_ENV_PREFIX).from_env()?;
    apply_self_signed(config, env);
    Ok(())
}

/// Apply `SELF_SIGNED_*` variables from an explicit set of pairs.
pub fn apply_self_signed_vars<I>(config: &mut SelfSignedConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    let env: SelfSignedEnv = envy::prefixed(SELF_SIGNED_ENV_PREFIX).from_iter(vars)?;
    apply_self_signed(config, env);
    Ok(())
}

fn apply_self_signed(config: &mut SelfSignedConfig, env: SelfSignedEnv) {
    // Empty variables leave the file values alone.
    if let Some(ca) = env.ca.filter(|v| !v.trim().is_empty()) {
        debug!("SELF_SIGNED_CA override");
        config.ca = Some(ca);
    }
    if let Some(key) = env.ca_private_key.filter(|v| !v.trim().is_empty()) {
        debug!("SELF_SIGNED_CA_PRIVATE_KEY override");
        config.ca_private_key = Some(key);
    }
    if let Some(days) = env.validity_days {
        config.validity_days = days;
    }
}

fn apply(config: &mut AcmeConfig, env: AcmeEnv) {
    if let Some(email) = env.email {
        debug!(email = %email, "ACME_EMAIL override");
        config.email = email;
    }
    if let Some(url) = env.directory_url {
        debug!(directory_url = %url, "ACME_DIRECTORY_URL override");
        config.directory_url = url;
    }
    // Both halves are required for a binding.
    if let (Some(id), Some(key)) = (env.external_account_id, env.external_account_key) {
        if !id.is_empty() && !key.is_empty() {
            debug!(eab_kid = %id, "ACME external account override");
            config.external_account = Some(ExternalAccountConfig { id, key });
        }
    }
    if let Some(tries) = env.max_sanity_check_tries {
        config.max_sanity_check_tries = tries;
    }
    if let Some(interval) = env.sanity_check_interval {
        config.sanity_check_interval_secs = interval;
    }
}
