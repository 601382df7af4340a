use crate::error::Result;
use crate::hi::request::FastcgiRequest;
use crate::hi::response::FastcgiResponse;
use crate::s11n::ProtocolStatus;

use std::any::Any;
use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Application code that answers requests.
///
/// `call` returns the application status for END_REQUEST. Output written to the response
/// before returning is flushed and terminated by the engine, so handlers normally don't call
/// [`FastcgiResponse::finish`] themselves. An `Err` (or a panic) is reported on STDERR and the
/// request ends with the configured error status.
pub trait FastcgiRequestHandler: Send + Sync {
    fn call(&self, request: &mut FastcgiRequest<'_>, response: &mut FastcgiResponse<'_>)
        -> std::result::Result<i32, HandlerError>;
}

impl<H: FastcgiRequestHandler + ?Sized> FastcgiRequestHandler for Arc<H> {
    fn call(&self, request: &mut FastcgiRequest<'_>, response: &mut FastcgiResponse<'_>)
        -> std::result::Result<i32, HandlerError>
    {
        (**self).call(request, response)
    }
}

/// A handler made from a closure; see [`handler_fn`].
#[derive(Clone, Copy, Debug)]
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> HandlerFn<F>
    where F: Fn(&mut FastcgiRequest<'_>, &mut FastcgiResponse<'_>)
                -> std::result::Result<i32, HandlerError> + Send + Sync
{
    HandlerFn { f }
}

impl<F> FastcgiRequestHandler for HandlerFn<F>
    where F: Fn(&mut FastcgiRequest<'_>, &mut FastcgiResponse<'_>)
                -> std::result::Result<i32, HandlerError> + Send + Sync
{
    fn call(&self, request: &mut FastcgiRequest<'_>, response: &mut FastcgiResponse<'_>)
        -> std::result::Result<i32, HandlerError>
    {
        (self.f)(request, response)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

fn report_failure(response: &mut FastcgiResponse<'_>, request_id: u16, msg: String) {
    error!("request {}: {}", request_id, msg);
    if !response.is_finished() {
        if let Err(e) = response.eprint(&format!("{}\n", msg)) {
            warn!("request {}: could not report the failure on stderr: {}", request_id, e);
        }
    }
}

/// Runs the handler for one request and makes sure the request gets finalised, whatever the
/// handler did. Any body left unread is drained first.
///
/// Only errors that leave the connection unusable are returned.
pub fn run_handler<H: FastcgiRequestHandler + ?Sized>(
    handler: &H,
    request: &mut FastcgiRequest<'_>,
    response: &mut FastcgiResponse<'_>,
    error_status: i32,
    ) -> Result<()>
{
    let request_id = request.request_id();
    let app_status = match panic::catch_unwind(AssertUnwindSafe(|| handler.call(request, response))) {
        Ok(Ok(app_status)) => app_status,
        Ok(Err(e)) => {
            report_failure(response, request_id, format!("request handler failed: {}", e));
            error_status
        }
        Err(payload) => {
            let msg = format!("request handler panicked: {}", panic_message(&*payload));
            report_failure(response, request_id, msg);
            error_status
        }
    };

    let drained = request.body().discard();
    let finished = if response.is_finished() {
        Ok(())
    } else {
        response.finish(app_status, ProtocolStatus::RequestComplete)
    };

    match drained {
        Err(e) if e.is_fatal() => {
            if let Err(f) = finished {
                warn!("request {}: could not finish: {}", request_id, f);
            }
            Err(e)
        }
        Err(e) => {
            debug!("request {}: {}", request_id, e);
            finished
        }
        Ok(n) => {
            if n > 0 {
                debug!("request {}: discarded {} unread body bytes", request_id, n);
            }
            finished
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FastcgiError;
    use crate::hi::request::{Body, BodySource, RequestHead};
    use crate::lowlevel::FastcgiRecord;
    use crate::params::Params;
    use crate::s11n::{EndRequestBody, RecordType, Role};

    use bytes::Bytes;
    use std::io::Read;

    fn head() -> RequestHead {
        RequestHead {
            request_id: 1,
            role: Role::Responder,
            keep_connection: false,
            params: Params::new(),
        }
    }

    fn run<H: FastcgiRequestHandler>(handler: H, body: &'static [u8]) -> Vec<FastcgiRecord> {
        let mut records: Vec<FastcgiRecord> = vec![];
        {
            let mut request = FastcgiRequest::new(head(), Body::buffered(Bytes::from_static(body)));
            let mut response = FastcgiResponse::new(1, &mut records, 8192, 1);
            run_handler(&handler, &mut request, &mut response, 1).unwrap();
        }
        records
    }

    fn end_status(records: &[FastcgiRecord]) -> i32 {
        let end = records.last().unwrap();
        assert_eq!(end.kind(), Some(RecordType::EndRequest));
        EndRequestBody::parse(&end.content).unwrap().app_status
    }

    fn stderr(records: &[FastcgiRecord]) -> String {
        records.iter()
            .filter(|r| r.kind() == Some(RecordType::Stderr))
            .map(|r| String::from_utf8_lossy(&r.content).into_owned())
            .collect()
    }

    #[test]
    fn success() {
        let records = run(handler_fn(|req, resp| {
            let body = req.content()?;
            resp.write_stdout(&body)?;
            Ok(0)
        }), b"echo");
        assert_eq!(&records[0].content[..], b"echo");
        assert_eq!(end_status(&records), 0);
    }

    #[test]
    fn handler_error_goes_to_stderr() {
        let records = run(handler_fn(|_req, _resp| Err("database is down".into())), b"");
        assert!(stderr(&records).contains("database is down"));
        assert_eq!(end_status(&records), 1);
    }

    #[test]
    fn handler_panic_is_contained() {
        let records = run(handler_fn(|_req, resp| {
            resp.print("half a page")?;
            panic!("oops");
        }), b"");
        assert_eq!(&records[0].content[..], b"half a page");
        assert!(stderr(&records).contains("oops"));
        assert_eq!(end_status(&records), 1);
    }

    #[test]
    fn handler_may_finish_itself() {
        let records = run(handler_fn(|_req, resp| {
            resp.finish(5, ProtocolStatus::RequestComplete)?;
            Ok(0)
        }), b"");
        assert_eq!(records.iter().filter(|r| r.kind() == Some(RecordType::EndRequest)).count(), 1);
        assert_eq!(end_status(&records), 5);
    }

    struct Failing;

    impl BodySource for Failing {
        fn next_chunk(&mut self) -> Result<Option<Bytes>> {
            Err(FastcgiError::TruncatedStream("gone".to_owned()))
        }
    }

    #[test]
    fn fatal_body_errors_are_returned() {
        let mut records: Vec<FastcgiRecord> = vec![];
        let mut source = Failing;
        let mut request = FastcgiRequest::new(head(), Body::streaming(&mut source));
        let mut response = FastcgiResponse::new(1, &mut records, 8192, 1);
        let handler = handler_fn(|req, _resp| {
            let mut buf = vec![];
            req.read_to_end(&mut buf)?;
            Ok(0)
        });
        let err = run_handler(&handler, &mut request, &mut response, 1).unwrap_err();
        assert!(matches!(err, FastcgiError::TruncatedStream(_)));
        assert!(response.is_finished());
    }
}
