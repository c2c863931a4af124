//! Server configuration.
//!
//! Options are read from a plain `key = value` file; every key has a
//! default so the server also runs without one. The options cover the
//! listen address, worker count, privilege-drop identity, queue
//! location and advertised hostname.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Default ceiling for a message body, one MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {0}: expected `key = value`")]
    Syntax(usize),
    #[error("line {0}: unknown option `{1}`")]
    UnknownOption(usize, String),
    #[error("line {0}: invalid value for `{1}`")]
    InvalidValue(usize, String),
}

/// The complete server configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Host name or address to listen on.
    pub listen_host: String,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Name advertised in the greeting and stamped into messages.
    pub hostname: String,
    /// Number of worker slots, i.e. concurrently served connections.
    pub n_workers: usize,
    /// User to run as after binding.
    pub user: String,
    /// Group to run as after binding.
    pub group: String,
    /// Directory the server chroots into.
    pub root_dir: PathBuf,
    /// Queue directory for stored messages, inside the root.
    pub queue_dir: PathBuf,
    /// Hard ceiling on the bytes a session may accumulate.
    pub max_message_size: usize,
    /// Domains for which recipients are accepted; empty accepts all.
    pub local_domains: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_host: "127.0.0.1".into(),
            listen_port: 8025,
            hostname: "localhost".into(),
            n_workers: 8,
            user: "nobody".into(),
            group: "nogroup".into(),
            root_dir: PathBuf::from("/var/spool/mailroom"),
            queue_dir: PathBuf::from("queue"),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            local_domains: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path` on top of the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parses `key = value` lines. `#` starts a comment.
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        for (idx, line) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or(ConfigError::Syntax(lineno))?;
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            config.set(key, value, lineno)?;
        }
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str, lineno: usize)
           -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue(lineno, key.into());
        match key {
            "listen_host" => self.listen_host = value.into(),
            "listen_port" => {
                self.listen_port = value.parse().map_err(|_| invalid())?
            }
            "hostname" => self.hostname = value.into(),
            "n_workers" => {
                let n: usize = value.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                self.n_workers = n;
            }
            "user" => self.user = value.into(),
            "group" => self.group = value.into(),
            "root_dir" => self.root_dir = PathBuf::from(value),
            "queue_dir" => self.queue_dir = PathBuf::from(value),
            "max_message_size" => {
                let n: usize = value.parse().map_err(|_| invalid())?;
                if n == 0 {
                    return Err(invalid());
                }
                self.max_message_size = n;
            }
            "local_domains" => {
                self.local_domains = value
                    .split([',', ' '])
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            _ => {
                return Err(ConfigError::UnknownOption(lineno, key.into()))
            }
        }
        Ok(())
    }

    /// The queue directory as seen after a successful chroot.
    pub fn effective_queue_dir(&self) -> PathBuf {
        if unsafe { libc::geteuid() } == 0 {
            Path::new("/").join(&self.queue_dir)
        } else {
            self.root_dir.join(&self.queue_dir)
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} as {}:{}, {} workers, queue {}",
               self.listen_host, self.listen_port, self.user, self.group,
               self.n_workers, self.queue_dir.display())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_without_file() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_options_and_comments() {
        let config = Config::from_str(
            "# mailroom config\n\
             listen_host = 0.0.0.0\n\
             listen_port = 2525\n\
             hostname = \"mail.example.com\"  # advertised\n\
             n_workers = 3\n\
             local_domains = example.com, example.org\n",
        )
        .unwrap();
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.listen_port, 2525);
        assert_eq!(config.hostname, "mail.example.com");
        assert_eq!(config.n_workers, 3);
        assert_eq!(config.local_domains,
                   vec!["example.com".to_string(), "example.org".into()]);
    }

    #[test]
    fn rejects_unknown_option() {
        let err = Config::from_str("no_such_thing = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOption(1, _)));
    }

    #[test]
    fn rejects_zero_workers() {
        let err = Config::from_str("n_workers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(1, _)));
    }

    #[test]
    fn rejects_missing_equals() {
        let err = Config::from_str("listen_port 2525\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax(1)));
    }
}
