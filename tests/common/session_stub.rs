use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub advertise_length: bool,
    /// How many initial requests are held for `stall_for` before answering.
    pub stall_first: usize,
    pub stall_for: Duration,
}

impl Route {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            advertise_length: true,
            stall_first: 0,
            stall_for: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::ok("error")
        }
    }

    /// Omits Content-Length so the body goes out chunked.
    pub fn chunked(mut self) -> Self {
        self.advertise_length = false;
        self
    }

    pub fn stalling(mut self, requests: usize, stall_for: Duration) -> Self {
        self.stall_first = requests;
        self.stall_for = stall_for;
        self
    }
}

pub struct SessionStub {
    pub base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SessionStub {
    pub fn spawn(routes: Vec<(&str, Route)>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start session stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");

        let routes = routes
            .into_iter()
            .map(|(path, route)| (path.to_owned(), route))
            .collect::<HashMap<_, _>>();
        let hits = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
        let server_hits = Arc::clone(&hits);

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
                let seen = {
                    let mut hits = server_hits.lock().expect("lock hits");
                    let count = hits.entry(path.clone()).or_insert(0);
                    *count += 1;
                    *count - 1
                };

                let Some(route) = routes.get(&path).cloned() else {
                    let _ = request
                        .respond(tiny_http::Response::from_string("not found").with_status_code(404));
                    continue;
                };

                if seen < route.stall_first {
                    thread::spawn(move || {
                        thread::sleep(route.stall_for);
                        respond(request, &route);
                    });
                    continue;
                }

                thread::spawn(move || respond(request, &route));
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

impl Drop for SessionStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn respond(request: tiny_http::Request, route: &Route) {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    let length = route.advertise_length.then_some(route.body.len());
    let response = tiny_http::Response::new(
        tiny_http::StatusCode(route.status),
        vec![header],
        Cursor::new(route.body.clone()),
        length,
        None,
    );
    let _ = request.respond(response);
}
