//! `requests` module: blocking HTTP client.
//!
//! Signatures:
//! - `get(url, headers?, proxy?, redirect?, timeoutMs?)`
//! - `post(url, data, headers?, proxy?, redirect?, timeoutMs?)`
//! - `put(url, data, headers?, proxy?, redirect?, timeoutMs?)`
//! - `delete(url, headers?, proxy?, redirect?, timeoutMs?)`
//!
//! Every call answers `{success, errorMessage, code, headers, content}`.
//! Transport failures produce `success = false` instead of a script error.
//! `timeoutMs` bounds connection setup only; a slow transfer is not cut off.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE, SET_COOKIE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{optional_arg, string_arg, type_name, unsupported, CapabilityError, REQUESTS};

pub(super) const FUNCTIONS: &[&str] = &["get", "post", "put", "delete"];

const DEFAULT_TIMEOUT_MS: u64 = 100_000;
const MAX_REDIRECTS: usize = 10;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/83.0.4103.116 Safari/537.36";

/// Request body as the script passed it.
#[derive(Debug, PartialEq)]
enum Body {
    /// Tables and objects are sent as JSON.
    Json(String),
    /// Strings are sent as form data.
    Form(String),
}

#[derive(Debug)]
struct Options {
    headers: Vec<(String, String)>,
    proxy: Option<String>,
    redirect: bool,
    timeout: Duration,
}

pub(super) fn call(function: &str, args: &[Value]) -> Result<Value, CapabilityError> {
    let (name, method, has_body): (&'static str, Method, bool) = match function {
        "get" => ("get", Method::GET, false),
        "post" => ("post", Method::POST, true),
        "put" => ("put", Method::PUT, true),
        "delete" => ("delete", Method::DELETE, false),
        _ => return Err(unsupported(REQUESTS, function)),
    };

    let url = string_arg(name, args, 0)?;
    let (body, rest) = if has_body {
        (Some(parse_body(name, args.get(1))?), args.get(2..).unwrap_or_default())
    } else {
        (None, args.get(1..).unwrap_or_default())
    };
    let options = parse_options(name, rest)?;

    debug!(method = %method, url, "HTTP request");
    Ok(perform(method, url, body, &options))
}

fn parse_body(function: &'static str, data: Option<&Value>) -> Result<Body, CapabilityError> {
    match data {
        Some(Value::String(text)) => Ok(Body::Form(text.clone())),
        Some(value @ (Value::Object(_) | Value::Array(_))) => Ok(Body::Json(value.to_string())),
        other => Err(CapabilityError::InvalidArgument {
            function,
            message: format!("data must be a string or a table, got {}", type_name(other)),
        }),
    }
}

fn parse_options(function: &'static str, args: &[Value]) -> Result<Options, CapabilityError> {
    let headers = match optional_arg(args, 0) {
        None => Vec::new(),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(key, value)| {
                let value = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                (key.clone(), value)
            })
            .collect(),
        Some(other) => {
            return Err(CapabilityError::InvalidArgument {
                function,
                message: format!("headers must be a table, got {}", type_name(Some(other))),
            })
        }
    };
    let proxy = optional_arg(args, 1)
        .and_then(Value::as_str)
        .filter(|proxy| !proxy.is_empty())
        .map(str::to_string);
    let redirect = optional_arg(args, 2).and_then(Value::as_bool).unwrap_or(true);
    let timeout = optional_arg(args, 3)
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_TIMEOUT_MS);

    Ok(Options {
        headers,
        proxy,
        redirect,
        timeout: Duration::from_millis(timeout),
    })
}

fn perform(method: Method, url: &str, body: Option<Body>, options: &Options) -> Value {
    match send(method, url, body, options) {
        Ok(response) => response,
        Err(e) => json!({
            "success": false,
            "errorMessage": e.to_string(),
            "code": 0,
            "headers": {},
            "content": "",
        }),
    }
}

fn send(method: Method, url: &str, body: Option<Body>, options: &Options) -> reqwest::Result<Value> {
    let mut client = Client::builder()
        .redirect(if options.redirect {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::none()
        })
        .connect_timeout(options.timeout)
        .timeout(None::<Duration>);
    // Only an explicit proxy argument is honoured, never the host environment.
    client = match &options.proxy {
        Some(proxy) => client.proxy(reqwest::Proxy::all(proxy)?),
        None => client.no_proxy(),
    };
    let client = client.build()?;

    let request = apply_headers(client.request(method, url), &options.headers, body.as_ref());
    let request = match body {
        Some(Body::Json(text) | Body::Form(text)) => request.body(text),
        None => request,
    };

    let response = request.send()?;
    let code = response.status().as_u16();

    let mut headers = Map::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        if *name == SET_COOKIE {
            if let Some(Value::String(cookies)) = headers.get_mut(SET_COOKIE.as_str()) {
                cookies.push_str("; ");
                cookies.push_str(&value);
                continue;
            }
        }
        headers.insert(name.as_str().to_string(), Value::String(value));
    }

    let content = response.text()?;
    Ok(json!({
        "success": true,
        "errorMessage": "",
        "code": code,
        "headers": headers,
        "content": content,
    }))
}

fn apply_headers(mut request: RequestBuilder, headers: &[(String, String)], body: Option<&Body>) -> RequestBuilder {
    let has = |name: &str| headers.iter().any(|(key, _)| key.eq_ignore_ascii_case(name));

    if !has(ACCEPT.as_str()) {
        request = request.header(ACCEPT, "*/*");
    }
    if !has(USER_AGENT.as_str()) {
        request = request.header(USER_AGENT, DEFAULT_USER_AGENT);
    }
    if !has(CONTENT_TYPE.as_str()) {
        match body {
            Some(Body::Json(_)) => request = request.header(CONTENT_TYPE, "application/json"),
            Some(Body::Form(_)) => request = request.header(CONTENT_TYPE, "application/x-www-form-urlencoded"),
            None => {}
        }
    }
    for (key, value) in headers {
        request = request.header(key.as_str(), value.as_str());
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned HTTP response and hand back the raw request.
    fn one_shot_server(response: &'static str) -> (String, thread::JoinHandle<String>) {
        delayed_server(response, Duration::ZERO)
    }

    /// Like [`one_shot_server`], holding the response back for `delay`.
    fn delayed_server(response: &'static str, delay: Duration) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/echo", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length: ").map(str::to_string))
                        .and_then(|len| len.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            thread::sleep(delay);
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn post_sends_tables_as_json() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 201 Created\r\nContent-Length: 2\r\nX-Test: yes\r\nConnection: close\r\n\r\nok",
        );
        let response = call("post", &[json!(url), json!({"a": 123})]).unwrap();
        let request = server.join().unwrap();

        assert_eq!(response["success"], true);
        assert_eq!(response["code"], 201);
        assert_eq!(response["content"], "ok");
        assert_eq!(response["headers"]["x-test"], "yes");
        assert!(request.starts_with("POST /echo"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.ends_with(r#"{"a":123}"#));
    }

    #[test]
    fn caller_headers_override_defaults() {
        let (url, server) =
            one_shot_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        let response = call("get", &[json!(url), json!({"User-Agent": "custom-agent"})]).unwrap();
        let request = server.join().unwrap().to_ascii_lowercase();

        assert_eq!(response["code"], 200);
        assert!(request.contains("user-agent: custom-agent"));
        assert!(request.contains("accept: */*"));
    }

    #[test]
    fn timeout_bounds_connecting_not_the_transfer() {
        let (url, server) = delayed_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nslow",
            Duration::from_millis(600),
        );
        let response = call("get", &[json!(url), Value::Null, Value::Null, Value::Null, json!(200)]).unwrap();
        server.join().unwrap();

        assert_eq!(response["success"], true, "{response}");
        assert_eq!(response["content"], "slow");
    }

    #[test]
    fn connection_failure_is_reported_in_the_response() {
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let response = call("get", &[json!(format!("http://127.0.0.1:{port}/"))]).unwrap();
        assert_eq!(response["success"], false);
        assert_eq!(response["code"], 0);
        assert!(!response["errorMessage"].as_str().unwrap().is_empty());
    }

    #[test]
    fn body_must_be_string_or_table() {
        assert!(matches!(
            call("put", &[json!("http://localhost/"), json!(5)]),
            Err(CapabilityError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn options_default_like_the_scripts_expect() {
        let options = parse_options("get", &[]).unwrap();
        assert!(options.redirect);
        assert!(options.proxy.is_none());
        assert_eq!(options.timeout, Duration::from_millis(DEFAULT_TIMEOUT_MS));
    }
}
