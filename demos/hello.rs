//! Says hello over a Unix socket using the tokio service.
//!
//! Point a web server at `hello.sock`, e.g. for nginx: `fastcgi_pass unix:/path/to/hello.sock;`.
//! Settings come from `fcgi-engine.toml` (if present) and `FCGI_ENGINE_*` variables.

use fcgi_engine::*;

use tokio::net::UnixListener;

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct HelloHandler {
    request_count: AtomicUsize,
}

impl HelloHandler {
    pub fn new() -> HelloHandler {
        HelloHandler {
            request_count: AtomicUsize::new(1),
        }
    }
}

impl FastcgiRequestHandler for HelloHandler {
    fn call(&self, request: &mut FastcgiRequest<'_>, response: &mut FastcgiResponse<'_>)
        -> std::result::Result<i32, HandlerError>
    {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        let uri = request.param("REQUEST_URI").unwrap_or("<unknown>").to_owned();

        let mut out = response.stdout();
        write!(out, "Content-Type: text/plain\r\n\r\n")?;
        writeln!(out, "Hello from {:?}: {}", uri, count)?;
        Ok(0)
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config_path = Path::new("fcgi-engine.toml");
    let config = EngineConfig::load(Some(config_path).filter(|p| p.exists()))
        .expect("failed to load configuration");

    let filename = "hello.sock";
    if let Err(e) = fs::remove_file(filename) {
        if e.kind() != io::ErrorKind::NotFound {
            panic!("failed to remove existing socket file {:?}: {}", filename, e);
        }
    }

    let listener = UnixListener::bind(filename).expect("failed to bind socket");
    fs::set_permissions(filename, fs::Permissions::from_mode(0o777))
        .expect("failed to make the socket world-writable");

    let service = FastcgiService::new(Arc::new(HelloHandler::new()), config);
    service.serve_unix(listener).await.expect("failed to run the server");
}
