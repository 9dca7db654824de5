use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Route {
    Html(String),
    /// Answers after `delay`.
    Slow { delay: Duration, body: String },
    /// Streams `bytes` of filler without a useful Content-Length.
    Large { bytes: usize },
    /// Returns `status` for the first `failures` hits, then `body`.
    FailThenOk {
        failures: usize,
        status: u16,
        body: String,
    },
    Status(u16),
    Redirect(String),
}

/// Minimal web site for fetch and pipeline tests. Unknown paths (including
/// `/robots.txt`) answer 404.
pub struct SiteStub {
    pub base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl SiteStub {
    pub fn spawn(routes: Vec<(&str, Route)>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start site stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let routes: Arc<HashMap<String, Route>> = Arc::new(
            routes
                .into_iter()
                .map(|(path, route)| (path.to_owned(), route))
                .collect(),
        );
        let hits = Arc::new(Mutex::new(HashMap::new()));

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let hit_log = Arc::clone(&hits);

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

                let path = request.url().to_string();
                let count = {
                    let mut hits = hit_log.lock().expect("lock hits");
                    let count = hits.entry(path.clone()).or_insert(0);
                    *count += 1;
                    *count
                };
                let route = routes.get(&path).cloned();
                thread::spawn(move || respond(request, route, count));
            }
        });

        Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .expect("lock hits")
            .get(path)
            .copied()
            .unwrap_or(0)
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

fn respond(request: tiny_http::Request, route: Option<Route>, count: usize) {
    let _ = match route {
        None => {
            request.respond(tiny_http::Response::from_string("not found").with_status_code(404))
        }
        Some(Route::Html(body)) => request.respond(html(body)),
        Some(Route::Slow { delay, body }) => {
            thread::sleep(delay);
            request.respond(html(body))
        }
        Some(Route::Large { bytes }) => {
            let reader = std::io::repeat(b'x');
            let response = tiny_http::Response::new(
                tiny_http::StatusCode(200),
                Vec::new(),
                std::io::Read::take(reader, bytes as u64),
                None,
                None,
            );
            request.respond(response)
        }
        Some(Route::FailThenOk {
            failures,
            status,
            body,
        }) => {
            if count <= failures {
                request.respond(tiny_http::Response::from_string("flaky").with_status_code(status))
            } else {
                request.respond(html(body))
            }
        }
        Some(Route::Status(status)) => {
            request.respond(tiny_http::Response::from_string("status").with_status_code(status))
        }
        Some(Route::Redirect(location)) => {
            let header = tiny_http::Header::from_bytes(&b"Location"[..], location.as_bytes())
                .expect("build location header");
            request.respond(
                tiny_http::Response::from_string("moved")
                    .with_status_code(302)
                    .with_header(header),
            )
        }
    };
}

fn html(body: String) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header =
        tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"text/html; charset=utf-8"[..])
            .expect("build header");
    tiny_http::Response::from_string(body).with_header(header)
}

/// An article with `sections` headed sections of ~300 chars each.
#[allow(dead_code)]
pub fn article(title: &str, sections: &[&str]) -> String {
    let mut body = format!("<html lang=\"en\"><head><title>{title}</title></head><body>");
    body.push_str("<nav><a href=\"/\">Home</a></nav><article>");
    body.push_str(&format!("<h1>{title}</h1>"));
    for (idx, marker) in sections.iter().enumerate() {
        body.push_str(&format!("<h2>Section {idx}</h2><p>"));
        for sentence in 0..6 {
            body.push_str(&format!(
                "{marker} sentence {sentence} in section {idx} talks about gardens and trees. "
            ));
        }
        body.push_str("</p>");
    }
    body.push_str("</article><footer>Copyright</footer></body></html>");
    body
}
