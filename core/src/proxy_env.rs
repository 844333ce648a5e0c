//! Proxy environment variables injected into the sandboxed process.

/// Destinations that must bypass the proxies: loopback plus RFC 1918.
pub const NO_PROXY_LIST: &str =
    "localhost,127.0.0.1,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

/// The environment that steers common tooling (curl, git, pip, npm,
/// rsync, grpc, docker) at the filtering proxies.
pub fn proxy_env(http_port: u16, socks_port: u16) -> Vec<(String, String)> {
    let http = format!("http://localhost:{http_port}");
    let socks = format!("socks5h://localhost:{socks_port}");
    vec![
        ("HTTP_PROXY".to_string(), http.clone()),
        ("HTTPS_PROXY".to_string(), http.clone()),
        ("http_proxy".to_string(), http.clone()),
        ("https_proxy".to_string(), http.clone()),
        ("NO_PROXY".to_string(), NO_PROXY_LIST.to_string()),
        ("no_proxy".to_string(), NO_PROXY_LIST.to_string()),
        ("ALL_PROXY".to_string(), socks),
        ("FTP_PROXY".to_string(), http.clone()),
        ("RSYNC_PROXY".to_string(), format!("localhost:{http_port}")),
        ("GRPC_PROXY".to_string(), http.clone()),
        ("DOCKER_HTTP_PROXY".to_string(), http.clone()),
        ("DOCKER_HTTPS_PROXY".to_string(), http),
    ]
}
