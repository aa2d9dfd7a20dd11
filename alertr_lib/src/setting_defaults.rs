/// The `Default` impl for `bool` is `false`.
/// This function covers the `true` case.
pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_host() -> String {
    "127.0.0.1".to_string()
}

pub(crate) fn default_port() -> String {
    "44556".to_string()
}

pub(crate) fn default_instance() -> String {
    "alertr-node".to_string()
}

pub(crate) fn default_handshake_timeout() -> u64 {
    20
}

pub(crate) fn default_greeting_timeout() -> u64 {
    10
}

pub(crate) fn default_msg_expiration() -> u64 {
    600
}

pub(crate) fn default_ping_interval() -> u64 {
    30
}

pub(crate) fn default_check_interval() -> u64 {
    5
}

pub(crate) fn default_ping_delay_warning() -> u64 {
    10
}

pub(crate) fn default_client_backoff_min() -> u64 {
    1000
}

pub(crate) fn default_client_backoff_max() -> u64 {
    2000
}

pub(crate) fn default_server_backoff_min() -> u64 {
    0
}

pub(crate) fn default_server_backoff_max() -> u64 {
    500
}
