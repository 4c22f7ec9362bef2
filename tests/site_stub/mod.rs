use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const SESSION_COOKIE: &str = "session=abc123";

pub static LOGO_PNG: &[u8] = &[
    137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4, 0,
    0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3, 1, 128,
    110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
];

/// A members-only site on `127.0.0.1` whose pages pull assets from the same
/// server addressed as `localhost`, standing in for a CDN.
pub struct SiteStub {
    pub port: u16,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl SiteStub {
    pub fn spawn() -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start site stub server");
        let port = server
            .server_addr()
            .to_ip()
            .expect("site stub listens on ip")
            .port();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let hits_handle = Arc::clone(&hits);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let path = url.split('?').next().unwrap_or(&url).to_owned();
                *hits_handle.lock().unwrap().entry(path.clone()).or_insert(0) += 1;

                let authenticated = request.headers().iter().any(|h| {
                    h.field.equiv("Cookie") && h.value.as_str().contains(SESSION_COOKIE)
                });
                let response = respond(port, &path, authenticated);
                let _ = request.respond(response);
            }
        });

        Self {
            port,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn site_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }

    pub fn cdn_url(&self, path: &str) -> String {
        format!("http://localhost:{}{path}", self.port)
    }

    pub fn site_dir(&self) -> String {
        format!("127.0.0.1_{}", self.port)
    }

    pub fn cdn_dir(&self) -> String {
        format!("localhost_{}", self.port)
    }

    /// Text of `/my/sjis`, which is served encoded as Shift_JIS.
    pub fn shift_jis_page(&self) -> String {
        shift_jis_page(self.port)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Drop for SiteStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

type StubResponse = tiny_http::Response<std::io::Cursor<Vec<u8>>>;

fn respond(port: u16, path: &str, authenticated: bool) -> StubResponse {
    if path.starts_with("/my/") && !path.ends_with(".js") && !authenticated {
        return tiny_http::Response::from_string("")
            .with_status_code(302)
            .with_header(header("Location", &format!("http://127.0.0.1:{port}/login")));
    }

    match path {
        "/" => html(
            r#"<!doctype html>
<html>
  <body>
    <a href="/my/home">Members</a>
    <a href="/other/page">Elsewhere</a>
  </body>
</html>
"#,
        ),
        "/my/sjis" => {
            let page = shift_jis_page(port);
            let (body, _, _) = encoding_rs::SHIFT_JIS.encode(&page);
            tiny_http::Response::from_data(body.into_owned())
                .with_header(header("Content-Type", "text/html; charset=Shift_JIS"))
        }
        "/my/home" => html(&format!(
            r#"<!doctype html>
<html>
  <head>
    <title>Home</title>
    <link rel="stylesheet" href="http://localhost:{port}/css/missing.css">
    <script src="/my/js/app.js"></script>
  </head>
  <body>
    <img src="http://localhost:{port}/x/logo.png" alt="Logo">
    <a href="http://127.0.0.1:{port}/my/next?int=9">Next</a>
    <a href="/my/next#details">Next again</a>
    <a href="/other/page">Elsewhere</a>
  </body>
</html>
"#
        )),
        "/my/next" => html(&format!(
            r#"<!doctype html>
<html>
  <head><title>Next</title></head>
  <body>
    <img src="http://localhost:{port}/x/logo.png" alt="Logo">
    <a href="/my/home">Home</a>
    <a href="next?int=3">Self</a>
  </body>
</html>
"#
        )),
        "/other/page" => html("<!doctype html><html><body>outside</body></html>"),
        "/login" => html(
            r#"<!doctype html><html><body><form><input name="email"><input name="pwd"></form></body></html>"#,
        ),
        "/my/js/app.js" => tiny_http::Response::from_string("console.log('app');")
            .with_header(header("Content-Type", "application/javascript")),
        "/x/logo.png" => tiny_http::Response::from_data(LOGO_PNG.to_vec())
            .with_header(header("Content-Type", "image/png")),
        _ => tiny_http::Response::from_string("not found").with_status_code(404),
    }
}

fn shift_jis_page(port: u16) -> String {
    format!(
        r#"<!doctype html>
<html>
  <head><meta charset="Shift_JIS"><title>会員ページ</title></head>
  <body>
    <p>日本語のページ</p>
    <img src="http://localhost:{port}/x/logo.png" alt="ロゴ">
  </body>
</html>
"#
    )
}

fn html(body: &str) -> StubResponse {
    tiny_http::Response::from_string(body)
        .with_header(header("Content-Type", "text/html; charset=utf-8"))
}

fn header(name: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("build header")
}
