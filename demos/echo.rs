//! Echoes the request body and params back, one thread per connection, using the blocking
//! driver.

use fcgi_engine::*;

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::thread;

fn echo(request: &mut FastcgiRequest<'_>, response: &mut FastcgiResponse<'_>)
    -> std::result::Result<i32, HandlerError>
{
    let mut body = vec![];
    request.read_to_end(&mut body)?;

    let mut out = response.stdout();
    write!(out, "Content-Type: text/plain\r\n\r\n")?;
    for (name, value) in request.params() {
        writeln!(out, "{} = {}", String::from_utf8_lossy(name), String::from_utf8_lossy(value))?;
    }
    writeln!(out, "\n{} bytes of body:", body.len())?;
    out.write_all(&body)?;
    Ok(0)
}

fn main() {
    env_logger::init();

    let config = Arc::new(EngineConfig::load(None).expect("failed to load configuration"));
    let handler = Arc::new(handler_fn(echo));

    let filename = "echo.sock";
    if let Err(e) = fs::remove_file(filename) {
        if e.kind() != io::ErrorKind::NotFound {
            panic!("failed to remove existing socket file {:?}: {}", filename, e);
        }
    }
    let listener = UnixListener::bind(filename).expect("failed to bind socket");
    fs::set_permissions(filename, fs::Permissions::from_mode(0o777))
        .expect("failed to make the socket world-writable");

    for socket in listener.incoming() {
        let socket = match socket {
            Ok(socket) => socket,
            Err(e) => {
                eprintln!("accept failed: {}", e);
                continue;
            }
        };
        let reader = socket.try_clone().expect("failed to clone the socket");
        let config = config.clone();
        let handler = handler.clone();
        thread::spawn(move || {
            if let Err(e) = Connection::new(reader, socket, config).serve(&*handler) {
                eprintln!("connection failed: {}", e);
            }
        });
    }
}
