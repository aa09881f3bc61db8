#![allow(dead_code)]

use std::sync::Arc;

use arbor::config::AppConfig;
use arbor::session::store::SessionStore;
use arbor::tree::{HandlerNode, PageHandler, Signature};
use arbor::Application;

pub mod temp_files {
    use tempfile::TempDir;

    /// Fresh directory removed when the guard drops
    pub fn session_dir() -> TempDir {
        tempfile::Builder::new()
            .prefix("arbor_sessions_")
            .tempdir()
            .unwrap()
    }
}

/// `/` shows a greeting, `/count` increments `count` in the session
pub fn counter_tree() -> HandlerNode {
    HandlerNode::new()
        .index(PageHandler::new("index", Signature::new(), |_, _| Ok("hello".into())))
        .page(
            "count",
            PageHandler::new("count", Signature::new(), |ctx, _| {
                let session = ctx.session()?;
                let count = session.get_as::<i64>("count")?.unwrap_or(0) + 1;
                session.insert("count", count)?;
                Ok(count.to_string().into())
            }),
        )
}

/// Counter app with sessions on, over `store`
pub fn counter_app(store: Arc<dyn SessionStore>, timeout_minutes: f64) -> Application {
    let config = AppConfig::new()
        .with("/", "tools.sessions.on", true)
        .with("/", "tools.sessions.timeout", timeout_minutes)
        .with_global("tools.sessions.clean_freq", 0);
    Application::with_session_store(counter_tree(), config, store)
}

/// `name=value` from the first `Set-Cookie` header value
pub fn cookie_pair(set_cookie: &str) -> String {
    set_cookie.split(';').next().unwrap_or_default().trim().to_string()
}

pub mod http_client {
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    /// Parsed HTTP/1.1 reply
    #[derive(Debug)]
    pub struct Reply {
        pub status: u16,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl Reply {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub fn set_cookies(&self) -> Vec<&str> {
            self.headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
                .map(|(_, v)| v.as_str())
                .collect()
        }
    }

    /// Send one `Connection: close` request and read the whole reply
    pub fn send(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)], body: &str) -> Reply {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
        for (k, v) in headers {
            request.push_str(&format!("{k}: {v}\r\n"));
        }
        request.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
        stream.write_all(request.as_bytes()).unwrap();

        let mut raw = String::new();
        stream.read_to_string(&mut raw).unwrap();
        parse(&raw)
    }

    pub fn get(addr: SocketAddr, path: &str, cookie: Option<&str>) -> Reply {
        match cookie {
            Some(c) => send(addr, "GET", path, &[("Cookie", c)], ""),
            None => send(addr, "GET", path, &[], ""),
        }
    }

    fn parse(raw: &str) -> Reply {
        let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
        let mut lines = head.lines();
        let status = lines
            .next()
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse().ok())
            .unwrap();
        let headers = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Reply {
            status,
            headers,
            body: body.to_string(),
        }
    }
}
