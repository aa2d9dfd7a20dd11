use std::collections::HashMap;
use std::fs::{File, create_dir_all};
use std::io::{BufReader, prelude::*};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellexpand::tilde;

use crate::channel::{ConnectionSettings, ListenerSettings};
use crate::communication::CommunicationConfig;
use crate::error::Error;
use crate::greeting::{NodeIdentity, NodeType};
use crate::internal_prelude::*;
use crate::setting_defaults::*;
use crate::watchdog::WatchdogConfig;

/// The environment variable that can be set to overwrite alertr's config path.
pub const ALERTR_CONFIG_PATH_ENV: &str = "ALERTR_CONFIG_PATH";

/// All settings which are used by both, nodes and the server.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
pub struct Shared {
    /// Don't access this property directly, but rather use the getter with the same name.
    /// It's only public to allow proper integration testing.
    ///
    /// The directory that is used for all of alertr's state, e.g. the generated certificates.
    pub alertr_directory: Option<PathBuf>,
    /// Don't access this property directly, but rather use the getter with the same name.
    ///
    /// The location where runtime related files will be placed.
    /// Defaults to `alertr_directory` unless `$XDG_RUNTIME_DIR` is set.
    pub runtime_directory: Option<PathBuf>,

    /// If this is set to true, unix sockets will be used.
    /// This only makes sense for nodes that run on the same machine as the server.
    #[cfg(unix)]
    #[serde(default = "Default::default")]
    pub use_unix_socket: bool,
    /// Don't access this property directly, but rather use the getter with the same name.
    ///
    /// The path to the unix socket.
    #[cfg(unix)]
    pub unix_socket_path: Option<PathBuf>,
    /// Unix socket permissions. Typically specified as an octal number.
    #[cfg(unix)]
    pub unix_socket_permissions: Option<u32>,

    /// The TCP hostname/ip address.
    #[serde(default = "default_host")]
    pub host: String,
    /// The TCP port.
    #[serde(default = "default_port")]
    pub port: String,
    /// Encrypt TCP connections via TLS. Plain TCP must only be used for local testing.
    #[serde(default = "default_true")]
    pub use_tls: bool,

    /// The path to the TLS certificate used by the server. \
    /// This is also used by nodes to verify the server's identity.
    pub server_cert: Option<PathBuf>,
    /// The path to the TLS key used by the server.
    pub server_key: Option<PathBuf>,
    /// The certificate a node authenticates itself with. Only needed if the server requires it.
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// If set, the server only accepts nodes with a certificate that's signed by this CA.
    pub client_ca: Option<PathBuf>,
}

/// All settings which are used by nodes.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
pub struct Client {
    #[serde(default = "Default::default")]
    pub username: String,
    #[serde(default = "Default::default")]
    pub password: String,
    #[serde(default = "Default::default")]
    pub node_type: NodeType,
    /// The name this node registers with.
    #[serde(default = "default_instance")]
    pub instance: String,
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Seconds to wait for each step of a handshake.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Seconds to wait for each greeting message of the server.
    #[serde(default = "default_greeting_timeout")]
    pub greeting_timeout: u64,
    /// Seconds after which messages are considered expired.
    #[serde(default = "default_msg_expiration")]
    pub msg_expiration: u64,
    /// Milliseconds to wait at least, before retrying after giving way to the server.
    #[serde(default = "default_client_backoff_min")]
    pub backoff_min: u64,
    /// Milliseconds to wait at most, before retrying after giving way to the server.
    #[serde(default = "default_client_backoff_max")]
    pub backoff_max: u64,

    /// Send a ping, if nothing has been exchanged for this many seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Seconds between two connection checks and between two reconnect attempts.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Warn if a ping takes longer than this many seconds.
    #[serde(default = "default_ping_delay_warning")]
    pub ping_delay_warning: u64,
}

/// All settings which are used by the server.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
pub struct Server {
    /// The credentials of all nodes that're allowed to connect. `username: password`
    #[serde(default = "HashMap::new")]
    pub users: HashMap<String, String>,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    #[serde(default = "default_greeting_timeout")]
    pub greeting_timeout: u64,
    #[serde(default = "default_msg_expiration")]
    pub msg_expiration: u64,
    #[serde(default = "default_server_backoff_min")]
    pub backoff_min: u64,
    #[serde(default = "default_server_backoff_max")]
    pub backoff_max: u64,
}

impl Default for Shared {
    fn default() -> Self {
        Shared {
            alertr_directory: None,
            runtime_directory: None,

            #[cfg(unix)]
            use_unix_socket: false,
            #[cfg(unix)]
            unix_socket_path: None,
            #[cfg(unix)]
            unix_socket_permissions: Some(0o700),
            host: default_host(),
            port: default_port(),
            use_tls: true,

            server_cert: None,
            server_key: None,
            client_cert: None,
            client_key: None,
            client_ca: None,
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Client {
            username: String::new(),
            password: String::new(),
            node_type: NodeType::default(),
            instance: default_instance(),
            persistent: true,
            handshake_timeout: default_handshake_timeout(),
            greeting_timeout: default_greeting_timeout(),
            msg_expiration: default_msg_expiration(),
            backoff_min: default_client_backoff_min(),
            backoff_max: default_client_backoff_max(),
            ping_interval: default_ping_interval(),
            check_interval: default_check_interval(),
            ping_delay_warning: default_ping_delay_warning(),
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Server {
            users: HashMap::new(),
            handshake_timeout: default_handshake_timeout(),
            greeting_timeout: default_greeting_timeout(),
            msg_expiration: default_msg_expiration(),
            backoff_min: default_server_backoff_min(),
            backoff_max: default_server_backoff_max(),
        }
    }
}

/// The parent settings struct. \
/// This contains all other setting structs.
#[derive(PartialEq, Eq, Clone, Default, Debug, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default = "Default::default")]
    pub client: Client,
    #[serde(default = "Default::default")]
    pub server: Server,
    #[serde(default = "Default::default")]
    pub shared: Shared,
    #[serde(default = "HashMap::new")]
    pub profiles: HashMap<String, NestedSettings>,
}

/// The nested settings struct for profiles. \
/// In contrast to the normal `Settings` struct, this struct doesn't allow profiles.
/// That way we prevent nested profiles and problems with self-referencing structs.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
pub struct NestedSettings {
    #[serde(default = "Default::default")]
    pub client: Client,
    #[serde(default = "Default::default")]
    pub server: Server,
    #[serde(default = "Default::default")]
    pub shared: Shared,
}

pub fn default_configuration_directory() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("alertr"))
}

/// Get the default config directory.
/// If no config can be found, fallback to the current directory.
pub fn configuration_directories() -> Vec<PathBuf> {
    if let Some(config_dir) = default_configuration_directory() {
        vec![config_dir, PathBuf::from(".")]
    } else {
        vec![PathBuf::from(".")]
    }
}

/// Little helper which expands a given path's `~` characters to a fully qualified path.
pub fn expand_home(old_path: &Path) -> PathBuf {
    PathBuf::from(tilde(&old_path.to_string_lossy()).into_owned())
}

fn optional_path(path: &Option<PathBuf>) -> Option<PathBuf> {
    path.as_deref().map(expand_home)
}

impl Shared {
    pub fn alertr_directory(&self) -> PathBuf {
        if let Some(path) = &self.alertr_directory {
            expand_home(path)
        } else if let Some(path) = dirs::data_local_dir() {
            path.join("alertr")
        } else {
            PathBuf::from("./alertr")
        }
    }

    /// Get the current runtime directory in the following precedence.
    /// 1. Config value
    /// 2. Environment configuration
    /// 3. alertr directory
    pub fn runtime_directory(&self) -> PathBuf {
        if let Some(path) = &self.runtime_directory {
            expand_home(path)
        } else if let Some(path) = dirs::runtime_dir() {
            path
        } else {
            self.alertr_directory()
        }
    }

    /// The unix socket path can either be explicitly specified or it's simply placed in the
    /// current runtime directory.
    #[cfg(unix)]
    pub fn unix_socket_path(&self) -> PathBuf {
        if let Some(path) = &self.unix_socket_path {
            expand_home(path)
        } else {
            self.runtime_directory().join("alertr.socket")
        }
    }

    pub fn server_cert(&self) -> PathBuf {
        if let Some(path) = &self.server_cert {
            expand_home(path)
        } else {
            self.alertr_directory().join("certs").join("server.cert")
        }
    }

    pub fn server_key(&self) -> PathBuf {
        if let Some(path) = &self.server_key {
            expand_home(path)
        } else {
            self.alertr_directory().join("certs").join("server.key")
        }
    }

    /// The settings a node needs to connect to the server.
    /// This loads the server's certificate from disk, if TLS is used.
    pub fn connection_settings(&self) -> Result<ConnectionSettings, Error> {
        #[cfg(unix)]
        if self.use_unix_socket {
            return Ok(ConnectionSettings::UnixSocket {
                path: self.unix_socket_path(),
            });
        }

        #[cfg(feature = "tls")]
        if self.use_tls {
            let client_auth = match (optional_path(&self.client_cert), optional_path(&self.client_key)) {
                (Some(cert), Some(key)) => Some(crate::tls::ClientIdentity::load(&cert, &key)?),
                (None, None) => None,
                _ => {
                    return Err(Error::ConfigDeserialization(
                        "client_cert and client_key have to be set together".into(),
                    ));
                }
            };

            return Ok(ConnectionSettings::TlsTcpSocket {
                host: self.host.clone(),
                port: self.port.clone(),
                certificate: crate::tls::load_ca(&self.server_cert())?,
                client_auth,
            });
        }

        warn!("Connecting via unencrypted TCP.");
        Ok(ConnectionSettings::TcpSocket {
            host: self.host.clone(),
            port: self.port.clone(),
        })
    }

    /// The settings the server needs to listen for nodes.
    /// If TLS is used, a self-signed certificate is created, unless one exists already.
    pub fn listener_settings(&self) -> Result<ListenerSettings, Error> {
        #[cfg(unix)]
        if self.use_unix_socket {
            return Ok(ListenerSettings::UnixSocket {
                path: self.unix_socket_path(),
                permissions: self.unix_socket_permissions,
            });
        }

        #[cfg(feature = "tls")]
        if self.use_tls {
            let cert_path = self.server_cert();
            let key_path = self.server_key();
            crate::tls::create_certificates(&cert_path, &key_path)?;
            let client_ca = optional_path(&self.client_ca);

            return Ok(ListenerSettings::TlsTcpSocket {
                host: self.host.clone(),
                port: self.port.clone(),
                identity: crate::tls::ServerIdentity::load(
                    &cert_path,
                    &key_path,
                    client_ca.as_deref(),
                )?,
            });
        }

        Ok(ListenerSettings::TcpSocket {
            host: self.host.clone(),
            port: self.port.clone(),
        })
    }
}

impl Client {
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            username: self.username.clone(),
            password: self.password.clone(),
            node_type: self.node_type,
            instance: self.instance.clone(),
            persistent: self.persistent,
        }
    }

    pub fn communication_config(&self) -> CommunicationConfig {
        let handshake_timeout = Duration::from_secs(self.handshake_timeout);
        CommunicationConfig {
            is_server: false,
            handshake_timeout,
            inbound_timeout: handshake_timeout,
            msg_expiration: self.msg_expiration,
            backoff_min: Duration::from_millis(self.backoff_min),
            backoff_max: Duration::from_millis(self.backoff_max),
            ..CommunicationConfig::client()
        }
    }

    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_secs(self.check_interval),
            retry_interval: Duration::from_secs(self.check_interval),
            ping_interval: Duration::from_secs(self.ping_interval),
            ping_delay_warning: Duration::from_secs(self.ping_delay_warning),
        }
    }
}

impl Server {
    pub fn communication_config(&self) -> CommunicationConfig {
        let handshake_timeout = Duration::from_secs(self.handshake_timeout);
        CommunicationConfig {
            is_server: true,
            handshake_timeout,
            inbound_timeout: handshake_timeout,
            msg_expiration: self.msg_expiration,
            backoff_min: Duration::from_millis(self.backoff_min),
            backoff_max: Duration::from_millis(self.backoff_max),
            ..CommunicationConfig::server()
        }
    }
}

impl Settings {
    /// Try to read existing config files, while using default values for non-existing fields.
    /// If successful, this will return a full config as well as a boolean on whether we found an
    /// existing configuration file or not.
    pub fn read(from_file: &Option<PathBuf>) -> Result<(Settings, bool), Error> {
        // If no explicit path is provided, we look for the ALERTR_CONFIG_PATH env variable.
        let from_file = from_file
            .clone()
            .or_else(|| std::env::var(ALERTR_CONFIG_PATH_ENV).map(PathBuf::from).ok());

        // Load the config from a very specific file path
        if let Some(path) = &from_file {
            let file = File::open(path)
                .map_err(|err| Error::IoPathError(path.clone(), "opening config file", err))?;
            let reader = BufReader::new(file);

            let settings = serde_yaml::from_reader(reader)
                .map_err(|err| Error::ConfigDeserialization(err.to_string()))?;
            return Ok((settings, true));
        };

        info!("Parsing config files");

        for directory in configuration_directories().into_iter() {
            let path = directory.join("alertr.yml");
            info!("Checking path: {path:?}");

            if path.exists() && path.is_file() {
                info!("Found config file at: {path:?}");

                let file = File::open(&path)
                    .map_err(|err| Error::IoPathError(path, "opening config file.", err))?;
                let reader = BufReader::new(file);

                let settings = serde_yaml::from_reader(reader)
                    .map_err(|err| Error::ConfigDeserialization(err.to_string()))?;
                return Ok((settings, true));
            }
        }

        info!("No config file found. Use default config.");
        Ok((Settings::default(), false))
    }

    /// Save the current configuration as a file to the given path. \
    /// If no path is given, the default configuration path will be used.
    pub fn save(&self, path: &Option<PathBuf>) -> Result<(), Error> {
        let config_path = if let Some(path) = path {
            path.clone()
        } else if let Ok(path) = std::env::var(ALERTR_CONFIG_PATH_ENV) {
            PathBuf::from(path)
        } else if let Some(path) = default_configuration_directory() {
            path.join("alertr.yml")
        } else {
            return Err(Error::Generic(
                "Failed to resolve default config directory. User home cannot be determined."
                    .into(),
            ));
        };
        let config_dir = config_path
            .parent()
            .ok_or_else(|| Error::InvalidPath("Couldn't resolve config directory".into()))?;

        // Create the config dir, if it doesn't exist yet
        if !config_dir.exists() {
            create_dir_all(config_dir).map_err(|err| {
                Error::IoPathError(config_dir.to_path_buf(), "creating config dir", err)
            })?;
        }

        let content = serde_yaml::to_string(self).map_err(|err| {
            Error::Generic(format!("Configuration file serialization failed:\n{err}"))
        })?;
        let mut file = File::create(&config_path).map_err(|err| {
            Error::IoPathError(config_dir.to_path_buf(), "creating settings file", err)
        })?;
        file.write_all(content.as_bytes()).map_err(|err| {
            Error::IoPathError(config_dir.to_path_buf(), "writing settings file", err)
        })?;

        Ok(())
    }

    /// Try to load a profile. Error if it doesn't exist.
    pub fn load_profile(&mut self, profile: &str) -> Result<(), Error> {
        let profile = self.profiles.remove(profile).ok_or_else(|| {
            Error::ConfigDeserialization(format!("Couldn't find profile with name \"{profile}\""))
        })?;

        self.client = profile.client;
        self.server = profile.server;
        self.shared = profile.shared;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Check if profiles get loaded correctly.
    #[test]
    fn load_profile() {
        let mut settings = Settings::default();
        assert_eq!(settings.client.ping_interval, default_ping_interval());
        assert_eq!(settings.shared.host, default_host());

        let mut profile = Settings::default();
        profile.client.ping_interval = 5;
        profile.server.users.insert("garage".into(), "secret".into());
        profile.shared.host = "alarm.home".to_string();
        let profile = NestedSettings {
            client: profile.client,
            server: profile.server,
            shared: profile.shared,
        };
        settings.profiles.insert("testprofile".to_string(), profile);

        settings
            .load_profile("testprofile")
            .expect("We just added the profile");

        assert_eq!(settings.client.ping_interval, 5);
        assert_eq!(
            settings.server.users.get("garage").map(String::as_str),
            Some("secret")
        );
        assert_eq!(settings.shared.host, "alarm.home");
    }

    /// A proper [Error] should be thrown if the profile cannot be found.
    #[test]
    fn error_on_missing_profile() {
        let mut settings = Settings::default();

        let result = settings.load_profile("doesn't exist");
        let expected_error_message = "Couldn't find profile with name \"doesn't exist\"";
        if let Err(Error::ConfigDeserialization(error_message)) = result {
            assert_eq!(error_message, expected_error_message);
            return;
        }

        panic!("Got unexpected result when expecting missing profile error: {result:?}");
    }

    /// Missing fields fall back to their defaults.
    #[test]
    fn read_partial_config() -> Result<(), Error> {
        let tempdir = tempfile::tempdir()?;
        let path = tempdir.path().join("alertr.yml");
        std::fs::write(
            &path,
            "client:\n  username: garage\n  node_type: alert\nserver:\n  users:\n    garage: secret\n",
        )?;

        let (settings, found) = Settings::read(&Some(path))?;
        assert!(found);
        assert_eq!(settings.client.username, "garage");
        assert_eq!(settings.client.node_type, NodeType::Alert);
        assert_eq!(settings.client.handshake_timeout, default_handshake_timeout());
        assert_eq!(settings.server.users.len(), 1);

        let config = settings.server.communication_config();
        assert!(config.is_server);
        assert_eq!(config.backoff_max, Duration::from_millis(500));

        Ok(())
    }

    #[test]
    fn save_and_read() -> Result<(), Error> {
        let tempdir = tempfile::tempdir()?;
        let path = tempdir.path().join("nested").join("alertr.yml");

        let mut settings = Settings::default();
        settings.client.instance = "front door".into();
        settings.save(&Some(path.clone()))?;

        let (read, _) = Settings::read(&Some(path))?;
        assert_eq!(read, settings);

        Ok(())
    }
}
