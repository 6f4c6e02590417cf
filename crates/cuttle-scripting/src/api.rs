//! Operation tables of the capability types, as seen from a script
//!
//! ```rhai
//! let h = response.header();
//! h["Content-Type"] = "text/plain";
//! h["X-Powered-By"] = ();            // delete
//! for entry in h { log::info(entry.key + "=" + entry.value); }
//!
//! let creds = request.basic_auth();
//! if creds == () { response.write_status(401); }
//! response.write("hello " + request.host);
//! ```

use crate::error::HostError;
use crate::header::{HeaderBridge, HeaderEntry};
use crate::request::RequestCapability;
use crate::response::ResponseCapability;
use rhai::plugin::*;
use rhai::{Array, Blob, Map, Shared, INT};
use std::sync::Arc;

/// Kind name reported in argument type errors
fn kind_of(value: &Dynamic) -> String {
    if value.is::<HeaderBridge>() {
        "header".to_string()
    } else if value.is::<HeaderEntry>() {
        "header_entry".to_string()
    } else if value.is::<ResponseCapability>() {
        "response".to_string()
    } else if value.is::<RequestCapability>() {
        "request".to_string()
    } else {
        value.type_name().to_string()
    }
}

fn text_arg(name: &'static str, value: Dynamic) -> Result<ImmutableString, HostError> {
    let found = kind_of(&value);
    value
        .into_immutable_string()
        .map_err(|_| HostError::invalid_type(name, "string", &found))
}

/// Assign `value` to `key`; the unit value deletes the key
fn assign(header: &HeaderBridge, key: &str, value: Dynamic) -> Result<(), HostError> {
    if value.is_unit() {
        header.delete(key);
        return Ok(());
    }
    let value = text_arg("value", value)?;
    header.insert_value(key, &value, false)
}

fn payload_bytes(payload: Dynamic) -> Result<Vec<u8>, HostError> {
    if payload.is::<Blob>() {
        Ok(payload.cast::<Blob>())
    } else if payload.is_string() {
        let found = kind_of(&payload);
        payload
            .into_immutable_string()
            .map(|s| s.as_bytes().to_vec())
            .map_err(|_| HostError::invalid_type("first", "bytes, string or char", &found))
    } else if payload.is_char() {
        let found = kind_of(&payload);
        payload
            .as_char()
            .map(|c| c.to_string().into_bytes())
            .map_err(|_| HostError::invalid_type("first", "bytes, string or char", &found))
    } else {
        Err(HostError::invalid_type(
            "first",
            "bytes, string or char",
            &kind_of(&payload),
        ))
    }
}

#[export_module]
mod header_api {
    use super::*;

    #[rhai_fn(index_get, return_raw)]
    pub fn index_get(header: &mut HeaderBridge, index: Dynamic) -> Result<String, Box<EvalAltResult>> {
        let key = text_arg("index", index)?;
        Ok(header.get(&key))
    }

    #[rhai_fn(index_set, return_raw)]
    pub fn index_set(
        header: &mut HeaderBridge,
        index: Dynamic,
        value: Dynamic,
    ) -> Result<(), Box<EvalAltResult>> {
        let key = text_arg("index", index)?;
        Ok(assign(header, &key, value)?)
    }

    /// First value of `key`, or `""`.
    #[rhai_fn(name = "get", pure, return_raw)]
    pub fn get_value(header: &mut HeaderBridge, key: Dynamic) -> Result<String, Box<EvalAltResult>> {
        let key = text_arg("index", key)?;
        Ok(header.get(&key))
    }

    /// Every value of `key`, in order.
    #[rhai_fn(pure, return_raw)]
    pub fn get_all(header: &mut HeaderBridge, key: Dynamic) -> Result<Array, Box<EvalAltResult>> {
        let key = text_arg("index", key)?;
        Ok(header.get_all(&key).into_iter().map(Dynamic::from).collect())
    }

    #[rhai_fn(name = "set", pure, return_raw)]
    pub fn set_value(
        header: &mut HeaderBridge,
        key: Dynamic,
        value: Dynamic,
    ) -> Result<(), Box<EvalAltResult>> {
        let key = text_arg("index", key)?;
        Ok(assign(header, &key, value)?)
    }

    /// Append a value, keeping the existing ones.
    #[rhai_fn(name = "add", pure, return_raw)]
    pub fn add_value(
        header: &mut HeaderBridge,
        key: Dynamic,
        value: Dynamic,
    ) -> Result<(), Box<EvalAltResult>> {
        let key = text_arg("index", key)?;
        let value = text_arg("value", value)?;
        Ok(header.insert_value(&key, &value, true)?)
    }

    #[rhai_fn(pure, return_raw)]
    pub fn delete(header: &mut HeaderBridge, key: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let key = text_arg("index", key)?;
        header.delete(&key);
        Ok(())
    }

    #[rhai_fn(pure, return_raw)]
    pub fn contains(header: &mut HeaderBridge, key: Dynamic) -> Result<bool, Box<EvalAltResult>> {
        let key = text_arg("index", key)?;
        Ok(header.contains(&key))
    }

    #[rhai_fn(pure)]
    pub fn keys(header: &mut HeaderBridge) -> Array {
        header.keys().into_iter().map(Dynamic::from).collect()
    }

    #[rhai_fn(pure)]
    pub fn len(header: &mut HeaderBridge) -> INT {
        header.len() as INT
    }

    #[rhai_fn(pure)]
    pub fn is_empty(header: &mut HeaderBridge) -> bool {
        header.is_empty()
    }

    /// Deep copy; changes to the copy never reach the response.
    #[rhai_fn(pure)]
    pub fn copy(header: &mut HeaderBridge) -> HeaderBridge {
        header.copy()
    }

    #[rhai_fn(name = "==", pure)]
    pub fn equals(header: &mut HeaderBridge, other: HeaderBridge) -> bool {
        header.equals(&other)
    }

    #[rhai_fn(name = "!=", pure)]
    pub fn not_equals(header: &mut HeaderBridge, other: HeaderBridge) -> bool {
        !header.equals(&other)
    }

    #[rhai_fn(name = "to_string", name = "to_debug", pure)]
    pub fn header_to_string(header: &mut HeaderBridge) -> String {
        header.to_string()
    }

    #[rhai_fn(get = "key", pure)]
    pub fn entry_key(entry: &mut HeaderEntry) -> String {
        entry.key.clone()
    }

    #[rhai_fn(get = "value", pure)]
    pub fn entry_value(entry: &mut HeaderEntry) -> String {
        entry.value.clone()
    }

    #[rhai_fn(name = "to_string", name = "to_debug", pure)]
    pub fn entry_to_string(entry: &mut HeaderEntry) -> String {
        format!("{}: {}", entry.key, entry.value)
    }
}

#[export_module]
mod response_api {
    use super::*;

    /// The response headers; the same bridge on every call.
    #[rhai_fn(pure)]
    pub fn header(response: &mut ResponseCapability) -> HeaderBridge {
        response.header()
    }

    /// Write a blob, string or char to the client; returns bytes written.
    #[rhai_fn(pure, return_raw)]
    pub fn write(response: &mut ResponseCapability, payload: Dynamic) -> Result<INT, Box<EvalAltResult>> {
        let bytes = payload_bytes(payload)?;
        let written = response
            .write(&bytes)
            .map_err(|err| HostError::Sink(Arc::new(err)))?;
        Ok(written as INT)
    }

    /// Commit the status line. Only the first call takes effect.
    #[rhai_fn(pure, return_raw)]
    pub fn write_status(response: &mut ResponseCapability, code: Dynamic) -> Result<(), Box<EvalAltResult>> {
        let code = code
            .as_int()
            .map_err(|_| HostError::invalid_type("first", "integer", &kind_of(&code)))?;
        Ok(response.commit_status(code)?)
    }

    #[rhai_fn(name = "to_string", name = "to_debug", pure)]
    pub fn response_to_string(_response: &mut ResponseCapability) -> String {
        "<response>".to_string()
    }
}

#[export_module]
mod request_api {
    use super::*;

    #[rhai_fn(get = "method", pure)]
    pub fn method(request: &mut RequestCapability) -> String {
        request.method().to_string()
    }

    #[rhai_fn(get = "url", pure)]
    pub fn url(request: &mut RequestCapability) -> String {
        request.url().to_string()
    }

    #[rhai_fn(get = "proto", pure)]
    pub fn proto(request: &mut RequestCapability) -> String {
        request.proto().to_string()
    }

    #[rhai_fn(get = "proto_major", pure)]
    pub fn proto_major(request: &mut RequestCapability) -> INT {
        request.proto_major()
    }

    #[rhai_fn(get = "proto_minor", pure)]
    pub fn proto_minor(request: &mut RequestCapability) -> INT {
        request.proto_minor()
    }

    #[rhai_fn(get = "host", pure)]
    pub fn host(request: &mut RequestCapability) -> String {
        request.host().to_string()
    }

    /// `#{username, password}` for Basic credentials, otherwise `()`.
    #[rhai_fn(pure)]
    pub fn basic_auth(request: &mut RequestCapability) -> Dynamic {
        match request.basic_auth() {
            Some(creds) => {
                let mut map = Map::new();
                map.insert("username".into(), Dynamic::from(creds.username));
                map.insert("password".into(), Dynamic::from(creds.password));
                Dynamic::from(map)
            }
            None => Dynamic::UNIT,
        }
    }

    /// A detached copy of the request headers.
    #[rhai_fn(name = "header", pure)]
    pub fn request_header(request: &mut RequestCapability) -> HeaderBridge {
        request.header()
    }

    #[rhai_fn(name = "to_string", name = "to_debug", pure)]
    pub fn request_to_string(request: &mut RequestCapability) -> String {
        format!("<request {} {}>", request.method(), request.url())
    }
}

/// Build the module holding every capability operation
///
/// Built once per runtime and registered into each run's engine.
pub(crate) fn host_api() -> Shared<Module> {
    let mut module = Module::new();
    combine_with_exported_module!(&mut module, "header", header_api);
    combine_with_exported_module!(&mut module, "response", response_api);
    combine_with_exported_module!(&mut module, "request", request_api);
    module.set_iterable::<HeaderBridge>();
    module.build_index();
    Shared::new(module)
}

/// Register the script-visible names of the capability types
pub(crate) fn register_types(engine: &mut Engine) {
    engine
        .register_type_with_name::<HeaderBridge>("header")
        .register_type_with_name::<HeaderEntry>("header_entry")
        .register_type_with_name::<ResponseCapability>("response")
        .register_type_with_name::<RequestCapability>("request")
        .register_type_with_name::<HostError>("host_error")
        .register_fn("to_string", |err: &mut HostError| err.to_string());
}
