use crate::cipher::CipherKind;
use crate::config::Config;
use crate::error::{Error, Result};

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the whole snapshot, reporting the first failure.
    pub fn validate(config: &Config) -> Result<()> {
        Self::validate_server(config)?;
        Self::validate_local(config)?;
        Self::validate_cipher(config)?;
        Self::validate_dns(config)?;
        Self::validate_limits(config)?;
        Ok(())
    }

    fn validate_server(config: &Config) -> Result<()> {
        if config.server_host.is_empty() {
            return Err(Error::config("Server host cannot be empty"));
        }
        if config.server_host.contains(char::is_whitespace) {
            return Err(Error::config("Server host cannot contain whitespace"));
        }
        if config.server_port == 0 {
            return Err(Error::config(
                "Invalid server port: must be between 1 and 65535",
            ));
        }
        if config.username.is_empty() {
            return Err(Error::config("Username cannot be empty"));
        }
        if config.password.is_empty() {
            return Err(Error::config("Password cannot be empty"));
        }
        Ok(())
    }

    fn validate_local(config: &Config) -> Result<()> {
        if config.local_host.is_empty() {
            return Err(Error::config("Local host cannot be empty"));
        }
        // local_port 0 is allowed: the listener picks an ephemeral port
        Ok(())
    }

    fn validate_cipher(config: &Config) -> Result<()> {
        if CipherKind::from_name(&config.method).is_none() {
            return Err(Error::config(format!(
                "Unsupported cipher: {}",
                config.method
            )));
        }
        Ok(())
    }

    fn validate_dns(config: &Config) -> Result<()> {
        if !config.doh_url.is_empty() {
            let url = url::Url::parse(&config.doh_url)
                .map_err(|e| Error::config(format!("Invalid DoH URL: {}", e)))?;
            if url.scheme() != "https" {
                return Err(Error::config("DoH URL must use HTTPS"));
            }
            if url.host_str().is_none() {
                return Err(Error::config("DoH URL has no host"));
            }
        }
        if !config.dot_host.is_empty() && config.dot_host.contains(char::is_whitespace) {
            return Err(Error::config("DoT host cannot contain whitespace"));
        }
        Ok(())
    }

    fn validate_limits(config: &Config) -> Result<()> {
        if config.parallel_max == 0 {
            return Err(Error::config("parallel_max must be at least 1"));
        }
        if config.tcp_keep_alive && config.tcp_keep_alive_interval == 0 {
            return Err(Error::config("TCP keep-alive interval cannot be zero"));
        }
        Ok(())
    }
}
