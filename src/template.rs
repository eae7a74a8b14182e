//! Fixed nginx templates and token substitution
//!
//! Templates are plain text with bare upper-case tokens: `DOMAIN`, `POD` and
//! `CERTKEY`. Rendering replaces every occurrence of each token in order.

/// Plain HTTP virtual host
pub const HTTP_VHOST_TEMPLATE: &str = r#"server {
          listen      80;
          access_log  logs/DOMAIN_access.log;
          error_log   logs/DOMAIN_error.log;
          server_name DOMAIN;

          location / {
                proxy_pass http://DOMAIN;
          }
}"#;

/// TLS virtual host, also listening on plain 80
pub const TLS_VHOST_TEMPLATE: &str = r#"server {
          listen 443 ssl;
          listen 80;
          access_log  logs/DOMAIN_access.log;
          error_log   logs/DOMAIN_error.log;
          server_name DOMAIN;
          ssl_protocols  SSLv2 SSLv3 TLSv1;
          ssl_ciphers  HIGH:!aNULL:!MD5;
          ssl_prefer_server_ciphers on;
          ssl_certificate vhosts/ssl/CERTKEY.pem;
          ssl_certificate_key vhosts/ssl/CERTKEY.key;

          location / {
                proxy_pass http://DOMAIN;
          }
}"#;

/// Upstream block
pub const UPSTREAM_TEMPLATE: &str = "
upstream DOMAIN {
POD
}
";

pub const DOMAIN_TOKEN: &str = "DOMAIN";
pub const POD_TOKEN: &str = "POD";
pub const CERTKEY_TOKEN: &str = "CERTKEY";

/// Replace each token with its value, in the given order
pub fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    substitutions
        .iter()
        .fold(template.to_string(), |text, (token, value)| text.replace(token, value))
}

/// Upstream block listing `servers` one per line
pub fn upstream(domain: &str, servers: &[String]) -> String {
    let servers = servers.join("\n");
    render(UPSTREAM_TEMPLATE, &[(DOMAIN_TOKEN, domain), (POD_TOKEN, &servers)])
}

/// Plain HTTP virtual host for `domain`
pub fn http_vhost(domain: &str) -> String {
    render(HTTP_VHOST_TEMPLATE, &[(DOMAIN_TOKEN, domain)])
}

/// TLS virtual host for `domain` using the key pair named `cert_id`
pub fn tls_vhost(domain: &str, cert_id: &str) -> String {
    render(TLS_VHOST_TEMPLATE, &[(DOMAIN_TOKEN, domain), (CERTKEY_TOKEN, cert_id)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_replaces_every_occurrence() {
        let out = render("DOMAIN and DOMAIN", &[(DOMAIN_TOKEN, "a.example.com")]);
        assert_eq!(out, "a.example.com and a.example.com");
    }

    #[test]
    fn test_upstream_block() {
        let servers = vec![
            "    server 10.0.0.1:80 max_fails=8 fail_timeout=3s;".to_string(),
            "    server 10.0.0.2:80 max_fails=8 fail_timeout=3s;".to_string(),
        ];
        let out = upstream("a.example.com", &servers);
        assert_eq!(
            out,
            concat!(
                "\nupstream a.example.com {\n",
                "    server 10.0.0.1:80 max_fails=8 fail_timeout=3s;\n",
                "    server 10.0.0.2:80 max_fails=8 fail_timeout=3s;\n",
                "}\n"
            )
        );
    }

    #[test]
    fn test_http_vhost() {
        let out = http_vhost("a.example.com");
        assert!(out.contains("server_name a.example.com;"));
        assert!(out.contains("proxy_pass http://a.example.com;"));
        assert!(out.contains("logs/a.example.com_access.log"));
        assert!(!out.contains("DOMAIN"));
        assert!(!out.contains("443"));
    }

    #[test]
    fn test_tls_vhost() {
        let out = tls_vhost("a.example.com", "site-cert");
        assert!(out.contains("listen 443 ssl;"));
        assert!(out.contains("listen 80;"));
        assert!(out.contains("ssl_certificate vhosts/ssl/site-cert.pem;"));
        assert!(out.contains("ssl_certificate_key vhosts/ssl/site-cert.key;"));
        assert!(!out.contains("CERTKEY"));
        assert!(!out.contains("DOMAIN"));
    }
}
