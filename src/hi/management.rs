//! Records addressed to the application as a whole rather than to a request.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::lowlevel::FastcgiRecord;
use crate::params::{decode_params, Params};
use crate::s11n::*;

/// Management records use request id 0; a record of a type we don't know is answered the same
/// way whatever its id.
pub fn is_management(record: &FastcgiRecord) -> bool {
    record.request_id == NULL_REQUEST_ID || record.kind().is_none()
}

pub fn management_reply(record: &FastcgiRecord, config: &EngineConfig) -> Result<FastcgiRecord> {
    match record.kind() {
        Some(RecordType::GetValues) => {
            let query = decode_params(record.content.clone())?;
            let mut values = Params::new();
            for (name, _) in query.iter() {
                let value = match name {
                    n if n == FCGI_MAX_CONNS.as_bytes() => config.max_conns.to_string(),
                    n if n == FCGI_MAX_REQS.as_bytes() => config.max_reqs.to_string(),
                    n if n == FCGI_MPXS_CONNS.as_bytes() => "0".to_owned(),
                    _ => {
                        debug!("GetValues: unknown variable {:?}", String::from_utf8_lossy(name));
                        continue;
                    }
                };
                values.insert(name, value);
            }
            debug!("GetValues: answering {} of {} variables", values.len(), query.len());
            FastcgiRecord::get_values_result(&values)
        }
        _ => {
            warn!("unknown management record type {} (request id {})",
                  record.record_type, record.request_id);
            Ok(FastcgiRecord::unknown_type(record.record_type))
        }
    }
}
