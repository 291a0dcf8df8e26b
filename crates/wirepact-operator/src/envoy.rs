//! Envoy bootstrap rendering
//!
//! The proxy sidecar runs two listeners. Inbound traffic passes an ext_authz
//! check against the translator's ingress port and is forwarded to the
//! application on localhost. Outbound traffic (the workload's HTTP_PROXY)
//! passes an ext_authz check against the translator's egress port and leaves
//! through a dynamic forward proxy.
//!
//! The document is built as a JSON value and serialized to YAML. Object keys
//! serialize in sorted order, so the output is a pure function of the ports.

use serde_json::{json, Value};

use wirepact_common::kube_utils::content_fingerprint;
use wirepact_common::Error;

/// Ports the bootstrap is rendered from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvoyPorts {
    /// Proxy inbound listener
    pub ingress: u16,
    /// Proxy outbound listener
    pub egress: u16,
    /// Application port on localhost
    pub app: u16,
    /// Translator inbound ext_authz
    pub translator_ingress: u16,
    /// Translator outbound ext_authz
    pub translator_egress: u16,
}

/// Rendered bootstrap document and its fingerprint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvoyBootstrap {
    /// YAML document
    pub config: String,
    /// Lowercase hex SHA-256 of `config`
    pub hash: String,
}

const HCM: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const EXT_AUTHZ: &str = "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
const ROUTER: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const FILE_LOG: &str = "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";
const STDOUT_LOG: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.stream.v3.StdoutAccessLog";
const HTTP_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const CARES: &str =
    "type.googleapis.com/envoy.extensions.network.dns_resolver.cares.v3.CaresDnsResolverConfig";

/// Render the bootstrap for the given ports.
pub fn render(ports: EnvoyPorts) -> Result<EnvoyBootstrap, Error> {
    let config = serde_yaml::to_string(&bootstrap_document(ports))
        .map_err(|e| Error::serialization_for_kind("EnvoyBootstrap", e.to_string()))?;
    let hash = content_fingerprint(config.as_bytes());
    Ok(EnvoyBootstrap { config, hash })
}

fn bootstrap_document(ports: EnvoyPorts) -> Value {
    json!({
        "admin": {
            "access_log": [{
                "name": "envoy.access_loggers.stdout",
                "typed_config": { "@type": STDOUT_LOG }
            }]
        },
        "static_resources": {
            "listeners": [
                listener(
                    "ingress_listener",
                    ports.ingress,
                    "ingress_http",
                    "target_service",
                    vec![ext_authz("auth_translator_ingress"), router()],
                ),
                listener(
                    "egress_listener",
                    ports.egress,
                    "egress_http",
                    "dynamic_forward_proxy_cluster",
                    vec![ext_authz("auth_translator_egress"), forward_proxy_filter(), router()],
                ),
            ],
            "clusters": [
                {
                    "name": "target_service",
                    "connect_timeout": "30s",
                    "type": "LOGICAL_DNS",
                    "load_assignment": local_endpoint("target_service", ports.app)
                },
                translator_cluster("auth_translator_ingress", ports.translator_ingress),
                translator_cluster("auth_translator_egress", ports.translator_egress),
                {
                    "name": "dynamic_forward_proxy_cluster",
                    "lb_policy": "CLUSTER_PROVIDED",
                    "cluster_type": {
                        "name": "envoy.clusters.dynamic_forward_proxy",
                        "typed_config": {
                            "@type": "type.googleapis.com/envoy.extensions.clusters.dynamic_forward_proxy.v3.ClusterConfig",
                            "dns_cache_config": dns_cache_config()
                        }
                    }
                }
            ]
        }
    })
}

fn listener(name: &str, port: u16, stat_prefix: &str, cluster: &str, filters: Vec<Value>) -> Value {
    json!({
        "name": name,
        "address": {
            "socket_address": {
                "protocol": "TCP",
                "address": "0.0.0.0",
                "port_value": port
            }
        },
        "filter_chains": [{
            "filters": [{
                "name": "envoy.filters.network.http_connection_manager",
                "typed_config": {
                    "@type": HCM,
                    "stat_prefix": stat_prefix,
                    "access_log": [{
                        "name": "envoy.access_loggers.file",
                        "typed_config": { "@type": FILE_LOG, "path": "/dev/stdout" }
                    }],
                    "route_config": {
                        "name": "local_route",
                        "virtual_hosts": [{
                            "name": "local_service",
                            "domains": ["*"],
                            "routes": [{
                                "match": { "prefix": "/" },
                                "route": { "cluster": cluster }
                            }]
                        }]
                    },
                    "http_filters": filters
                }
            }]
        }]
    })
}

fn ext_authz(cluster: &str) -> Value {
    json!({
        "name": "envoy.filters.http.ext_authz",
        "typed_config": {
            "@type": EXT_AUTHZ,
            "transport_api_version": "v3",
            "grpc_service": {
                "envoy_grpc": { "cluster_name": cluster },
                "timeout": "1s"
            },
            "include_peer_certificate": true
        }
    })
}

fn router() -> Value {
    json!({
        "name": "envoy.filters.http.router",
        "typed_config": { "@type": ROUTER }
    })
}

fn forward_proxy_filter() -> Value {
    json!({
        "name": "envoy.filters.http.dynamic_forward_proxy",
        "typed_config": {
            "@type": "type.googleapis.com/envoy.extensions.filters.http.dynamic_forward_proxy.v3.FilterConfig",
            "dns_cache_config": dns_cache_config()
        }
    })
}

fn dns_cache_config() -> Value {
    json!({
        "name": "dynamic_forward_proxy_cache_config",
        "dns_lookup_family": "V4_ONLY",
        "typed_dns_resolver_config": {
            "name": "envoy.network.dns_resolver.cares",
            "typed_config": {
                "@type": CARES,
                "resolvers": [{
                    "socket_address": { "address": "8.8.8.8", "port_value": 53 }
                }],
                "use_resolvers_as_fallback": true,
                "dns_resolver_options": {
                    "use_tcp_for_dns_lookups": true,
                    "no_default_search_domain": true
                }
            }
        }
    })
}

fn translator_cluster(name: &str, port: u16) -> Value {
    json!({
        "name": name,
        "connect_timeout": "0.25s",
        "type": "STRICT_DNS",
        "typed_extension_protocol_options": {
            HTTP_OPTIONS_KEY: {
                "@type": format!("type.googleapis.com/{HTTP_OPTIONS_KEY}"),
                "explicit_http_config": { "http2_protocol_options": {} }
            }
        },
        "load_assignment": local_endpoint(name, port)
    })
}

fn local_endpoint(cluster: &str, port: u16) -> Value {
    json!({
        "cluster_name": cluster,
        "endpoints": [{
            "lb_endpoints": [{
                "endpoint": {
                    "address": {
                        "socket_address": { "address": "127.0.0.1", "port_value": port }
                    }
                }
            }]
        }]
    })
}
