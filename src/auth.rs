//! Credential resolution for HTTP and FTP sources
//!
//! [`AuthConfigFactory`] decides which user/password pair a request is sent
//! with. Inline credentials in the URI win; then come the configured
//! defaults, the netrc file and, for FTP, anonymous login. With HTTP auth
//! challenge enabled, credentials are remembered per (host, port, path) and
//! reused for every path below it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use tracing::debug;
use url::Url;

use crate::config::EngineConfig;
use crate::error::{EngineError, ProtocolErrorKind, Result};

const AUTH_DEFAULT_USER: &str = "anonymous";
const AUTH_DEFAULT_PASSWD: &str = "ARIA2USER@";

/// A user/password pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub user: String,
    pub password: String,
}

impl AuthConfig {
    /// `None` when `user` is empty
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Option<Self> {
        let user = user.into();
        if user.is_empty() {
            return None;
        }
        Some(Self {
            user,
            password: password.into(),
        })
    }

    /// `user:password`, as used in a Basic authorization header
    pub fn auth_text(&self) -> String {
        format!("{}:{}", self.user, self.password)
    }
}

/// The parts of a request URI that credential lookup cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    /// Directory part of the path, always starting with "/"
    pub dir: String,
    pub username: String,
    pub password: Option<String>,
}

impl CredentialRequest {
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;
        let host = url
            .host_str()
            .ok_or_else(|| {
                EngineError::protocol(ProtocolErrorKind::InvalidUrl, format!("No host in {}", uri))
            })?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(0);
        let path = url.path();
        let dir = match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => path[..idx].to_string(),
        };
        Ok(Self {
            protocol: url.scheme().to_string(),
            host,
            port,
            dir,
            username: url.username().to_string(),
            password: url.password().map(str::to_string),
        })
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

/// Credential-related options
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub http_user: String,
    pub http_passwd: String,
    pub ftp_user: String,
    pub ftp_passwd: String,
    pub http_auth_challenge: bool,
    pub no_netrc: bool,
}

impl AuthOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            http_user: config.http.user.clone().unwrap_or_default(),
            http_passwd: config.http.passwd.clone().unwrap_or_default(),
            ftp_user: config.ftp.user.clone().unwrap_or_default(),
            ftp_passwd: config.ftp.passwd.clone().unwrap_or_default(),
            http_auth_challenge: config.http.auth_challenge,
            no_netrc: config.no_netrc,
        }
    }
}

/// One netrc entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrcAuthenticator {
    /// `None` for the `default` entry
    pub machine: Option<String>,
    pub login: String,
    pub password: String,
}

/// Parsed netrc file
#[derive(Debug, Clone, Default)]
pub struct Netrc {
    authenticators: Vec<NetrcAuthenticator>,
}

impl Netrc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_authenticator(&mut self, authenticator: NetrcAuthenticator) {
        self.authenticators.push(authenticator);
    }

    /// Parse netrc text. `macdef` bodies are skipped, `account` is ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut netrc = Netrc::new();
        let mut current: Option<NetrcAuthenticator> = None;
        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            let mut tokens = line.split_whitespace();
            while let Some(token) = tokens.next() {
                match token {
                    "machine" | "default" => {
                        if let Some(done) = current.take() {
                            netrc.add_authenticator(done);
                        }
                        let machine = if token == "machine" {
                            Some(Self::expect_value(&mut tokens, "machine")?)
                        } else {
                            None
                        };
                        current = Some(NetrcAuthenticator {
                            machine,
                            login: String::new(),
                            password: String::new(),
                        });
                    }
                    "login" | "password" | "account" => {
                        let value = Self::expect_value(&mut tokens, token)?;
                        let Some(entry) = current.as_mut() else {
                            return Err(EngineError::invalid_input(
                                "netrc",
                                format!("'{}' outside of a machine entry", token),
                            ));
                        };
                        match token {
                            "login" => entry.login = value,
                            "password" => entry.password = value,
                            _ => {}
                        }
                    }
                    "macdef" => {
                        // Body runs until the next blank line
                        for body in lines.by_ref() {
                            if body.trim().is_empty() {
                                break;
                            }
                        }
                        break;
                    }
                    other => {
                        return Err(EngineError::invalid_input(
                            "netrc",
                            format!("Unexpected token '{}'", other),
                        ));
                    }
                }
            }
        }
        if let Some(done) = current.take() {
            netrc.add_authenticator(done);
        }
        Ok(netrc)
    }

    fn expect_value<'a>(tokens: &mut impl Iterator<Item = &'a str>, key: &str) -> Result<String> {
        tokens
            .next()
            .map(str::to_string)
            .ok_or_else(|| EngineError::invalid_input("netrc", format!("Missing value for '{}'", key)))
    }

    /// Entry for `host`, falling back to `default` unless `ignore_default`
    pub fn find_authenticator(&self, host: &str, ignore_default: bool) -> Option<&NetrcAuthenticator> {
        self.authenticators
            .iter()
            .find(|a| a.machine.as_deref() == Some(host))
            .or_else(|| {
                if ignore_default {
                    None
                } else {
                    self.authenticators.iter().find(|a| a.machine.is_none())
                }
            })
    }
}

/// Chain of credential sources for one protocol
#[derive(Debug)]
struct AuthResolver<'a> {
    netrc: Option<&'a Netrc>,
    ignore_default: bool,
    user_defined: Option<AuthConfig>,
    default: Option<AuthConfig>,
}

impl AuthResolver<'_> {
    fn resolve(&self, host: &str) -> Option<AuthConfig> {
        if let Some(ac) = &self.user_defined {
            return Some(ac.clone());
        }
        if let Some(netrc) = self.netrc {
            if let Some(found) = netrc.find_authenticator(host, self.ignore_default) {
                return AuthConfig::new(found.login.clone(), found.password.clone());
            }
        }
        self.default.clone()
    }
}

/// Credentials remembered for a (host, port, path) prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCred {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    /// Always ends in "/"
    pub path: String,
    pub activated: bool,
}

impl BasicCred {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
        activated: bool,
    ) -> Self {
        let key = CredKey::new(host.into(), port, path.into());
        Self {
            user: user.into(),
            password: password.into(),
            host: key.host,
            port: key.port,
            path: key.path,
            activated,
        }
    }

    fn key(&self) -> CredKey {
        CredKey {
            host: self.host.clone(),
            port: self.port,
            path: self.path.clone(),
        }
    }
}

/// Ordered by host, then port, then path descending, so that for one
/// host and port the longest path comes first
#[derive(Debug, Clone, PartialEq, Eq)]
struct CredKey {
    host: String,
    port: u16,
    path: String,
}

impl CredKey {
    fn new(host: String, port: u16, mut path: String) -> Self {
        if !path.ends_with('/') {
            path.push('/');
        }
        Self { host, port, path }
    }
}

impl Ord for CredKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.host
            .cmp(&other.host)
            .then(self.port.cmp(&other.port))
            .then(other.path.cmp(&self.path))
    }
}

impl PartialOrd for CredKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct CredValue {
    user: String,
    password: String,
    activated: bool,
}

/// Resolves credentials and caches HTTP Basic credentials
#[derive(Debug, Default)]
pub struct AuthConfigFactory {
    netrc: Option<Netrc>,
    basic_creds: BTreeMap<CredKey, CredValue>,
}

impl AuthConfigFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_netrc(&mut self, netrc: Netrc) {
        self.netrc = Some(netrc);
    }

    /// Credentials to send with `request`, if any
    pub fn create_auth_config(
        &mut self,
        request: &CredentialRequest,
        options: &AuthOptions,
    ) -> Option<AuthConfig> {
        match request.protocol.as_str() {
            "http" | "https" => {
                if options.http_auth_challenge {
                    if !request.username.is_empty() {
                        self.update_basic_cred(BasicCred::new(
                            request.username.clone(),
                            request.password_or_empty(),
                            request.host.clone(),
                            request.port,
                            request.dir.clone(),
                            true,
                        ));
                        return AuthConfig::new(request.username.clone(), request.password_or_empty());
                    }
                    let cred = self.find_basic_cred(&request.host, request.port, &request.dir)?;
                    return AuthConfig::new(cred.user, cred.password);
                }
                if !request.username.is_empty() {
                    return AuthConfig::new(request.username.clone(), request.password_or_empty());
                }
                self.http_auth_resolver(options).resolve(&request.host)
            }
            "ftp" => {
                if request.username.is_empty() {
                    return self.ftp_auth_resolver(options).resolve(&request.host);
                }
                if request.has_password() {
                    return AuthConfig::new(request.username.clone(), request.password_or_empty());
                }
                if !options.no_netrc {
                    let resolver = AuthResolver {
                        netrc: self.netrc.as_ref(),
                        ignore_default: false,
                        user_defined: None,
                        default: None,
                    };
                    if let Some(ac) = resolver.resolve(&request.host) {
                        if ac.user == request.username {
                            return Some(ac);
                        }
                    }
                }
                AuthConfig::new(request.username.clone(), options.ftp_passwd.clone())
            }
            other => {
                debug!("No credentials for protocol {}", other);
                None
            }
        }
    }

    fn http_auth_resolver(&self, options: &AuthOptions) -> AuthResolver<'_> {
        AuthResolver {
            netrc: if options.no_netrc {
                None
            } else {
                self.netrc.as_ref()
            },
            ignore_default: true,
            user_defined: AuthConfig::new(options.http_user.clone(), options.http_passwd.clone()),
            default: None,
        }
    }

    fn ftp_auth_resolver(&self, options: &AuthOptions) -> AuthResolver<'_> {
        AuthResolver {
            netrc: if options.no_netrc {
                None
            } else {
                self.netrc.as_ref()
            },
            ignore_default: false,
            user_defined: AuthConfig::new(options.ftp_user.clone(), options.ftp_passwd.clone()),
            default: AuthConfig::new(AUTH_DEFAULT_USER, AUTH_DEFAULT_PASSWD),
        }
    }

    /// Insert `cred`, replacing an entry with the same key in place
    pub fn update_basic_cred(&mut self, cred: BasicCred) {
        let value = CredValue {
            user: cred.user.clone(),
            password: cred.password.clone(),
            activated: cred.activated,
        };
        self.basic_creds.insert(cred.key(), value);
    }

    /// Closest cached entry whose path is a prefix of `path`
    pub fn find_basic_cred(&self, host: &str, port: u16, path: &str) -> Option<BasicCred> {
        let probe = CredKey::new(host.to_string(), port, path.to_string());
        self.basic_creds
            .range(probe.clone()..)
            .take_while(|(k, _)| k.host == probe.host && k.port == probe.port)
            .find(|(k, _)| probe.path.starts_with(&k.path))
            .map(|(k, v)| BasicCred {
                user: v.user.clone(),
                password: v.password.clone(),
                host: k.host.clone(),
                port: k.port,
                path: k.path.clone(),
                activated: v.activated,
            })
    }

    /// Activate the matching cached entry, or resolve and cache a new one.
    /// Returns whether a credential is now active.
    pub fn activate_basic_cred(
        &mut self,
        host: &str,
        port: u16,
        path: &str,
        options: &AuthOptions,
    ) -> bool {
        let probe = CredKey::new(host.to_string(), port, path.to_string());
        let existing = self
            .basic_creds
            .range_mut(probe.clone()..)
            .take_while(|(k, _)| k.host == probe.host && k.port == probe.port)
            .find(|(k, _)| probe.path.starts_with(&k.path));
        if let Some((_, value)) = existing {
            value.activated = true;
            return true;
        }

        let Some(ac) = self.http_auth_resolver(options).resolve(host) else {
            return false;
        };
        self.update_basic_cred(BasicCred::new(ac.user, ac.password, host, port, path, true));
        true
    }

    pub fn num_basic_creds(&self) -> usize {
        self.basic_creds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> CredentialRequest {
        CredentialRequest::from_uri(uri).unwrap()
    }

    fn challenge_options() -> AuthOptions {
        AuthOptions {
            http_auth_challenge: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_request_dir() {
        let req = request("http://user:pw@example.org/a/b/file.iso");
        assert_eq!(req.dir, "/a/b");
        assert_eq!(req.port, 80);
        assert_eq!(req.username, "user");
        assert_eq!(request("ftp://example.org/file").dir, "/");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut factory = AuthConfigFactory::new();
        factory.update_basic_cred(BasicCred::new("root", "r", "h", 80, "/", true));
        factory.update_basic_cred(BasicCred::new("deep", "d", "h", 80, "/a/b", true));
        factory.update_basic_cred(BasicCred::new("other", "o", "h", 8080, "/a/b", true));

        let found = factory.find_basic_cred("h", 80, "/a/b/c").unwrap();
        assert_eq!(found.user, "deep");
        let found = factory.find_basic_cred("h", 80, "/a/x").unwrap();
        assert_eq!(found.user, "root");
        assert!(factory.find_basic_cred("g", 80, "/a").is_none());
    }

    #[test]
    fn test_update_replaces_in_place() {
        let mut factory = AuthConfigFactory::new();
        factory.update_basic_cred(BasicCred::new("old", "1", "h", 80, "/p", false));
        factory.update_basic_cred(BasicCred::new("new", "2", "h", 80, "/p/", true));
        assert_eq!(factory.num_basic_creds(), 1);
        let found = factory.find_basic_cred("h", 80, "/p").unwrap();
        assert_eq!(found.user, "new");
        assert!(found.activated);
    }

    #[test]
    fn test_http_challenge_remembers_inline_credentials() {
        let mut factory = AuthConfigFactory::new();
        let opts = challenge_options();
        let ac = factory
            .create_auth_config(&request("http://u:p@h/dir/f"), &opts)
            .unwrap();
        assert_eq!(ac.auth_text(), "u:p");

        let ac = factory
            .create_auth_config(&request("http://h/dir/sub/g"), &opts)
            .unwrap();
        assert_eq!(ac.user, "u");
        assert!(factory
            .create_auth_config(&request("http://h/elsewhere/g"), &opts)
            .is_none());
    }

    #[test]
    fn test_http_resolver_order() {
        let mut netrc = Netrc::new();
        netrc.add_authenticator(NetrcAuthenticator {
            machine: Some("h".into()),
            login: "netrc-user".into(),
            password: "np".into(),
        });
        netrc.add_authenticator(NetrcAuthenticator {
            machine: None,
            login: "default-user".into(),
            password: "dp".into(),
        });
        let mut factory = AuthConfigFactory::new();
        factory.set_netrc(netrc);

        let mut opts = AuthOptions::default();
        let ac = factory.create_auth_config(&request("http://h/f"), &opts).unwrap();
        assert_eq!(ac.user, "netrc-user");
        // HTTP ignores the netrc default entry
        assert!(factory.create_auth_config(&request("http://x/f"), &opts).is_none());

        opts.http_user = "cfg".into();
        let ac = factory.create_auth_config(&request("http://h/f"), &opts).unwrap();
        assert_eq!(ac.user, "cfg");

        opts.http_user.clear();
        opts.no_netrc = true;
        assert!(factory.create_auth_config(&request("http://h/f"), &opts).is_none());
    }

    #[test]
    fn test_ftp_flows() {
        let mut netrc = Netrc::new();
        netrc.add_authenticator(NetrcAuthenticator {
            machine: Some("f".into()),
            login: "alice".into(),
            password: "secret".into(),
        });
        let mut factory = AuthConfigFactory::new();
        factory.set_netrc(netrc);
        let opts = AuthOptions {
            ftp_passwd: "fallback".into(),
            ..Default::default()
        };

        let ac = factory.create_auth_config(&request("ftp://alice@f/x"), &opts).unwrap();
        assert_eq!(ac.password, "secret");

        let ac = factory.create_auth_config(&request("ftp://bob@f/x"), &opts).unwrap();
        assert_eq!(ac.auth_text(), "bob:fallback");

        let ac = factory.create_auth_config(&request("ftp://g/x"), &opts).unwrap();
        assert_eq!(ac.auth_text(), "anonymous:ARIA2USER@");

        assert!(factory
            .create_auth_config(&request("sftp://g/x"), &opts)
            .is_none());
    }

    #[test]
    fn test_activate_basic_cred() {
        let mut factory = AuthConfigFactory::new();
        let mut opts = AuthOptions::default();
        assert!(!factory.activate_basic_cred("h", 80, "/d", &opts));

        opts.http_user = "u".into();
        assert!(factory.activate_basic_cred("h", 80, "/d", &opts));
        assert!(factory.find_basic_cred("h", 80, "/d/e").unwrap().activated);

        factory.update_basic_cred(BasicCred::new("v", "", "h", 80, "/z", false));
        assert!(factory.activate_basic_cred("h", 80, "/z/y", &AuthOptions::default()));
        assert!(factory.find_basic_cred("h", 80, "/z").unwrap().activated);
    }

    #[test]
    fn test_netrc_parse() {
        let text = "machine a login x password y\n\
                    macdef init\ncd /pub\n\n\
                    default\n  login anon password guest\n";
        let netrc = Netrc::parse(text).unwrap();
        assert_eq!(netrc.find_authenticator("a", true).unwrap().login, "x");
        assert_eq!(netrc.find_authenticator("b", false).unwrap().login, "anon");
        assert!(netrc.find_authenticator("b", true).is_none());
        assert!(Netrc::parse("login x").is_err());
    }
}
