//! `mongodb+srv://` resolution (§4.11): `_mongodb._tcp.<host>` SRV records resolve the seed list,
//! and a single `<host>` TXT record may carry `authSource`/`replicaSet`/`loadBalanced` options.
//! Grounded on the teacher's `srv.rs` and `runtime/resolver.rs`.

use std::time::Duration;

use crate::{
    error::{Error, Result},
    options::{ClientOptions, ClientOptionsDraft, ServerAddress},
};

/// The result of resolving a `mongodb+srv://` hostname: the seed list from the SRV lookup, the
/// minimum TTL among its records (used by drivers that poll SRV records for topology changes,
/// not implemented by this crate), and whatever options the TXT record carried.
#[derive(Debug)]
pub struct ResolvedSrv {
    pub hosts: Vec<ServerAddress>,
    pub min_ttl: Duration,
    pub auth_source: Option<String>,
    pub replica_set: Option<String>,
    pub load_balanced: Option<bool>,
}

/// Parses and fully resolves a connection string, performing SRV/TXT DNS resolution when the
/// string uses the `mongodb+srv://` scheme. Plain `mongodb://` strings are resolved without any
/// network I/O, same as [`crate::options::parse`].
pub async fn resolve(uri: &str) -> Result<ClientOptions> {
    let parsed = crate::options::parse_connection_string(uri)?;
    let mut draft = ClientOptionsDraft::default();

    let hosts = if parsed.srv {
        let hostname = &parsed.hosts[0];
        let service_name = parsed.srv_service_name.as_deref().unwrap_or("mongodb");
        let resolved = resolve_srv(hostname, service_name).await?;

        // TXT options are lower precedence than explicit query-string options, so apply them
        // first and let `apply_uri_options` below overwrite anything the URI set explicitly.
        if let Some(auth_source) = resolved.auth_source {
            draft.auth_source = Some(auth_source);
        }
        if let Some(replica_set) = resolved.replica_set {
            draft.repl_set_name = Some(replica_set);
        }
        if let Some(load_balanced) = resolved.load_balanced {
            draft.load_balanced = Some(load_balanced);
        }
        // mongodb+srv:// implies TLS unless the connection string explicitly disables it.
        draft.tls_enabled = Some(true);

        resolved.hosts
    } else {
        parsed
            .hosts
            .iter()
            .map(|h| ServerAddress::parse(h))
            .collect::<Result<Vec<_>>>()?
    };

    crate::options::apply_uri_options(&mut draft, &parsed.options)?;
    draft.into_options(hosts, parsed.credential)
}

/// Runs just the SRV/TXT lookups for `hostname`, without parsing a full connection string. Used
/// directly by tests and by [`resolve`].
#[cfg(feature = "dns-resolver")]
pub async fn resolve_srv(hostname: &str, srv_service_name: &str) -> Result<ResolvedSrv> {
    let resolver = Resolver::new().await?;
    let lookup = resolver.get_srv_hosts(hostname, srv_service_name).await?;
    let (auth_source, replica_set, load_balanced) = resolver.get_txt_options(hostname).await?;
    Ok(ResolvedSrv {
        hosts: lookup.hosts,
        min_ttl: lookup.min_ttl,
        auth_source,
        replica_set,
        load_balanced,
    })
}

#[cfg(not(feature = "dns-resolver"))]
pub async fn resolve_srv(_hostname: &str, _srv_service_name: &str) -> Result<ResolvedSrv> {
    Err(Error::invalid_argument(
        "mongodb+srv:// connection strings require the 'dns-resolver' feature",
    ))
}

#[cfg(feature = "dns-resolver")]
struct SrvLookupResult {
    hosts: Vec<ServerAddress>,
    min_ttl: Duration,
}

#[cfg(feature = "dns-resolver")]
struct Resolver {
    inner: hickory_resolver::TokioAsyncResolver,
}

#[cfg(feature = "dns-resolver")]
impl Resolver {
    async fn new() -> Result<Self> {
        let inner = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
            Error::from(crate::error::ErrorKind::DnsResolve {
                message: e.to_string(),
            })
        })?;
        Ok(Resolver { inner })
    }

    /// Looks up `_mongodb._tcp.<hostname>`, validating that every returned target shares
    /// `hostname`'s domain (the SRV spec's anti-spoofing requirement).
    async fn get_srv_hosts(&self, hostname: &str, srv_service_name: &str) -> Result<SrvLookupResult> {
        use hickory_proto::rr::RData;

        let parts: Vec<&str> = hostname.split('.').collect();
        if parts.len() < 3 {
            return Err(Error::invalid_argument(
                "a 'mongodb+srv' hostname must have at least three '.'-delimited parts",
            ));
        }
        let domain = &parts[1..];

        let query = format!("_{srv_service_name}._tcp.{hostname}");
        let lookup = self.inner.srv_lookup(query.as_str()).await.map_err(|e| {
            Error::from(crate::error::ErrorKind::DnsResolve {
                message: e.to_string(),
            })
        })?;

        let mut hosts = Vec::new();
        let mut min_ttl = u32::MAX;
        for record in lookup.as_lookup().record_iter() {
            let srv = match record.data() {
                Some(RData::SRV(srv)) => srv,
                _ => continue,
            };
            let mut target = srv.target().to_utf8();
            if target.ends_with('.') {
                target.pop();
            }
            let target_parts: Vec<&str> = target.split('.').collect();
            if target_parts.len() < 2 || !target_parts[1..].ends_with(domain) {
                return Err(Error::from(crate::error::ErrorKind::DnsResolve {
                    message: format!(
                        "SRV lookup for {hostname} returned {target}, which does not belong to domain {}",
                        domain.join(".")
                    ),
                }));
            }

            min_ttl = min_ttl.min(record.ttl());
            hosts.push(ServerAddress::Tcp {
                host: target,
                port: srv.port(),
            });
        }

        if hosts.is_empty() {
            return Err(Error::from(crate::error::ErrorKind::DnsResolve {
                message: format!("SRV lookup for {hostname} returned no records"),
            }));
        }

        Ok(SrvLookupResult {
            hosts,
            min_ttl: Duration::from_secs(min_ttl as u64),
        })
    }

    /// Looks up a single TXT record on `hostname` and parses its `key=value&...` option string.
    /// Returns `(authSource, replicaSet, loadBalanced)`; absent fields are `None`.
    async fn get_txt_options(
        &self,
        hostname: &str,
    ) -> Result<(Option<String>, Option<String>, Option<bool>)> {
        let lookup = match self.inner.txt_lookup(hostname).await {
            Ok(lookup) => lookup,
            Err(e) => {
                use hickory_resolver::error::ResolveErrorKind;
                return match e.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => Ok((None, None, None)),
                    _ => Err(Error::from(crate::error::ErrorKind::DnsResolve {
                        message: e.to_string(),
                    })),
                };
            }
        };

        let mut records = lookup.iter();
        let Some(record) = records.next() else {
            return Ok((None, None, None));
        };
        if records.next().is_some() {
            return Err(Error::from(crate::error::ErrorKind::DnsResolve {
                message: format!("TXT lookup for {hostname} returned more than one record"),
            }));
        }

        let text: String = record
            .txt_data()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes))
            .collect();

        let mut auth_source = None;
        let mut replica_set = None;
        let mut load_balanced = None;
        for pair in text.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::from(crate::error::ErrorKind::DnsResolve {
                    message: format!("TXT record option '{pair}' is not a `key=value` pair"),
                }));
            };
            match key.to_ascii_lowercase().as_str() {
                "authsource" => auth_source = Some(value.to_string()),
                "replicaset" => replica_set = Some(value.to_string()),
                "loadbalanced" => {
                    load_balanced = Some(match value {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(Error::from(crate::error::ErrorKind::DnsResolve {
                                message: format!(
                                    "TXT record option 'loadBalanced={other}' must be true or false"
                                ),
                            }))
                        }
                    })
                }
                other => {
                    return Err(Error::from(crate::error::ErrorKind::DnsResolve {
                        message: format!(
                            "TXT record option '{other}' is not one of authSource, replicaSet, loadBalanced"
                        ),
                    }))
                }
            }
        }

        Ok((auth_source, replica_set, load_balanced))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn non_srv_connection_string_resolves_without_dns() {
        let opts = resolve("mongodb://a:27017,b:27018/?replicaSet=rs0").await.unwrap();
        assert_eq!(opts.hosts.len(), 2);
        assert_eq!(opts.repl_set_name.as_deref(), Some("rs0"));
    }
}
