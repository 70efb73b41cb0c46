//! Connection configuration shared by both clients.

use std::fmt;
use std::path::PathBuf;

/// Reconnect attempts allowed before the client gives up.
pub const MAX_RECONNECTS: usize = 10240;

const FALLBACK_HOST: &str = "127.0.0.1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Requestor,
    Replier,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Requestor => f.write_str("Requestor"),
            Role::Replier => f.write_str("Replier"),
        }
    }
}

/// One connection option. The list is applied in order by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientOption {
    Name(String),
    Credentials(PathBuf),
    /// Log disconnect, reconnect, close and error events.
    LifecycleLogging,
    MaxReconnects(usize),
    RootCertificates(PathBuf),
    ClientCertificate { cert: PathBuf, key: PathBuf },
}

/// Credentials and TLS material taken from the command line. Empty fields are
/// left out of the option list.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct ClientConfig {
    /// Credentials file
    #[arg(long = "creds", default_value = "")]
    pub creds: String,

    /// Client certificate file (enables TLS)
    #[arg(long = "tlscert", default_value = "")]
    pub tls_cert: String,

    /// Private key for the client certificate
    #[arg(long = "tlskey", default_value = "")]
    pub tls_key: String,

    /// CA certificate used to verify the server
    #[arg(long = "tlscacert", default_value = "")]
    pub tls_ca: String,
}

impl ClientConfig {
    pub fn client_options(&self, role: Role) -> Vec<ClientOption> {
        self.client_options_for_host(role, local_hostname())
    }

    pub fn client_options_for_host(&self, role: Role, hostname: Option<String>) -> Vec<ClientOption> {
        let hostname = hostname.unwrap_or_else(|| FALLBACK_HOST.to_string());
        let mut opts = vec![ClientOption::Name(format!("NATS_{} - {}", role, hostname))];

        if !self.creds.is_empty() {
            opts.push(ClientOption::Credentials(PathBuf::from(&self.creds)));
        }
        opts.push(ClientOption::LifecycleLogging);
        opts.push(ClientOption::MaxReconnects(MAX_RECONNECTS));
        if !self.tls_ca.is_empty() {
            opts.push(ClientOption::RootCertificates(PathBuf::from(&self.tls_ca)));
        }
        if !self.tls_cert.is_empty() {
            opts.push(ClientOption::ClientCertificate {
                cert: PathBuf::from(&self.tls_cert),
                key: PathBuf::from(&self.tls_key),
            });
        }
        opts
    }
}

/// Hostname from `gethostname(2)`, then `HOSTNAME`.
pub fn local_hostname() -> Option<String> {
    system_hostname()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

fn system_hostname() -> Option<String> {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // Safety: the buffer is valid for its full length; the result is
        // read only up to the first NUL.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc != 0 {
            return None;
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8(buf[..end].to_vec()).ok()
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials(opts: &[ClientOption]) -> usize {
        opts.iter()
            .filter(|o| matches!(o, ClientOption::Credentials(_)))
            .count()
    }

    #[test]
    fn empty_config_has_name_logging_and_reconnect_bound_only() {
        let opts = ClientConfig::default()
            .client_options_for_host(Role::Requestor, Some("box".into()));
        assert_eq!(
            opts,
            vec![
                ClientOption::Name("NATS_Requestor - box".into()),
                ClientOption::LifecycleLogging,
                ClientOption::MaxReconnects(10240),
            ]
        );
    }

    #[test]
    fn credentials_option_present_only_when_path_given() {
        let mut conf = ClientConfig::default();
        assert_eq!(credentials(&conf.client_options_for_host(Role::Replier, None)), 0);

        conf.creds = "/etc/nats/user.creds".into();
        let opts = conf.client_options_for_host(Role::Replier, None);
        assert_eq!(credentials(&opts), 1);
        assert_eq!(
            opts[1],
            ClientOption::Credentials(PathBuf::from("/etc/nats/user.creds"))
        );
    }

    #[test]
    fn hostname_falls_back_to_loopback() {
        let opts = ClientConfig::default().client_options_for_host(Role::Replier, None);
        assert_eq!(opts[0], ClientOption::Name("NATS_Replier - 127.0.0.1".into()));
    }

    #[test]
    fn tls_options_follow_reconnect_bound() {
        let conf = ClientConfig {
            creds: String::new(),
            tls_cert: "client.pem".into(),
            tls_key: "client-key.pem".into(),
            tls_ca: "ca.pem".into(),
        };
        let opts = conf.client_options_for_host(Role::Requestor, Some("h".into()));
        assert_eq!(
            &opts[2..],
            &[
                ClientOption::MaxReconnects(MAX_RECONNECTS),
                ClientOption::RootCertificates(PathBuf::from("ca.pem")),
                ClientOption::ClientCertificate {
                    cert: PathBuf::from("client.pem"),
                    key: PathBuf::from("client-key.pem"),
                },
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn system_hostname_is_read() {
        assert!(local_hostname().is_some_and(|h| !h.is_empty()));
    }
}
