//! Pages rendered by the proxy itself: error pages, the proxy auto-config
//! script and the project index.

use crate::projects::ConfiguredProject;
use std::collections::BTreeMap;

/// Escape text for inclusion in HTML
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
body {{ font-family: -apple-system, BlinkMacSystemFont, sans-serif; margin: 40px auto; max-width: 900px; color: #222; }}
h1 {{ font-size: 22px; }}
code, pre {{ background: #f4f4f4; padding: 2px 6px; border-radius: 3px; }}
pre {{ padding: 12px; }}
table {{ border-collapse: collapse; width: 100%; }}
th, td {{ text-align: left; padding: 6px 10px; border-bottom: 1px solid #ddd; }}
</style>
</head>
<body>
{body}
</body>
</html>
"#,
        title = escape(title),
        body = body
    )
}

/// Error page; `guidance_html` must already be escaped
pub fn error_page(title: &str, guidance_html: &str) -> String {
    layout(
        title,
        &format!("<h1>{}</h1>\n{}", escape(title), guidance_html),
    )
}

/// Guidance for a hostname that is not attached to any directory
pub fn unregistered_domain_guidance(host: &str, tld: &str) -> String {
    let name = host
        .strip_prefix("www.")
        .unwrap_or(host)
        .trim_end_matches(&format!(".{}", tld));
    format!(
        "<p>The hostname <code>{host}</code> is not linked to a directory yet.</p>\n\
         <p>Link it via the following command:</p>\n\
         <pre>devhost proxy:domain:attach {name} --dir=/some/dir</pre>",
        host = escape(host),
        name = escape(name)
    )
}

/// Guidance for a project whose web server is down
pub fn backend_not_running_guidance(host: &str, dir: &str) -> String {
    format!(
        "<p>The web server for <code>{host}</code> is not started yet.</p>\n\
         <p>Start it via the following command:</p>\n\
         <pre>devhost server:start --daemon --dir={dir} -- &lt;command&gt;</pre>",
        host = escape(host),
        dir = escape(dir)
    )
}

/// Guidance when the scheme does not match the port
pub fn wrong_port_guidance(scheme: &str, port: u16) -> String {
    let expected = if scheme == "https" { 443 } else { 80 };
    format!(
        "<p>You must use port {expected} for {upper} requests ({port} used).</p>",
        expected = expected,
        upper = scheme.to_uppercase(),
        port = port
    )
}

/// Proxy auto-config script routing only the TLD through the proxy
pub fn pac_script(tld: &str, host: &str, port: u16) -> String {
    format!(
        "// Only proxy *.{tld} requests\n\
         // Configuration file in ~/.devhost/proxy.json\n\
         function FindProxyForURL (url, host) {{\n\
         \tif (dnsDomainIs(host, '.{tld}')) {{\n\
         \t\treturn 'PROXY {host}:{port}';\n\
         \t}}\n\
         \n\
         \treturn 'DIRECT';\n\
         }}\n",
        tld = tld,
        host = host,
        port = port
    )
}

/// Index of every known project with its port and domains
pub fn index_page(projects: &BTreeMap<String, ConfiguredProject>) -> String {
    let mut rows = String::new();
    for (dir, project) in projects {
        let port = if project.port > 0 {
            format!(
                "<a href=\"{scheme}://127.0.0.1:{port}/\">{port}</a>",
                scheme = escape(&project.scheme),
                port = project.port
            )
        } else {
            "Not running".to_string()
        };

        let domains = project
            .domains
            .iter()
            .map(|domain| {
                if domain.contains('*') {
                    escape(domain)
                } else {
                    format!(
                        "<a href=\"{scheme}://{d}/\">{scheme}://{d}/</a>",
                        scheme = escape(&project.scheme),
                        d = escape(domain)
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("<br>");

        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(dir),
            port,
            domains
        ));
    }

    layout(
        "devhost proxy",
        &format!(
            "<h1>Local projects</h1>\n<table>\n<tr><th>Directory</th><th>Port</th><th>Domains</th></tr>\n{}</table>",
            rows
        ),
    )
}
