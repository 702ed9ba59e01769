//! Proxy-Auto-Config evaluation
//!
//! A PAC script is untrusted JavaScript that maps a target URL to an
//! ordered list of candidate routes. The script runs inside `boa_engine`
//! with the global namespace stripped down to an allow-list of built-ins
//! plus the PAC helper contract. boa's `Context` is not `Send`, so the
//! bounded pool is a set of dedicated worker threads each owning one
//! engine; jobs queue on a channel, which is also the backpressure point.

mod datetime;
mod glob;
mod helpers;

pub use glob::{glob_to_regex, GlobPatternCache};

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use boa_engine::{js_string, property::Attribute, Context, JsString, JsValue, Source};
use boa_runtime::Console;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::blacklist::RouteBlacklist;
use crate::error::{PorticoError, Result};
use crate::route::{parse_proxy_line, ProxyRoute};

/// Main entry point to a PAC script as defined by Netscape.
const STANDARD_ENTRY_POINT: &str = "FindProxyForURL";

/// IPv6-aware entry point as defined by Microsoft; preferred when present.
const IPV6_AWARE_ENTRY_POINT: &str = "FindProxyForURLEx";

/// Global names a PAC script is allowed to see. Everything else is deleted
/// from the sandbox before the script is evaluated.
const ALLOWED_GLOBALS: &[&str] = &[
    "Object", "Function", "Array", "String", "Date", "Number", "BigInt", "Boolean", "RegExp",
    "Math", "JSON", "NaN", "Infinity", "undefined", "isNaN", "isFinite", "parseFloat", "parseInt",
    "encodeURI", "encodeURIComponent", "decodeURI", "decodeURIComponent", "eval", "escape",
    "unescape", "Error", "EvalError", "RangeError", "ReferenceError", "SyntaxError", "TypeError",
    "URIError", "ArrayBuffer", "Int8Array", "Uint8Array", "Uint8ClampedArray", "Int16Array",
    "Uint16Array", "Int32Array", "Uint32Array", "Float32Array", "Float64Array", "BigInt64Array",
    "BigUint64Array", "DataView", "Map", "Set", "WeakMap", "WeakSet", "Symbol", "Reflect", "Proxy",
    "Promise", "SharedArrayBuffer", "Atomics", "console", "globalThis", "arguments",
];

enum EngineJob {
    /// Report which entry points the evaluated script defines.
    Probe {
        reply: oneshot::Sender<Option<&'static str>>,
    },
    /// Invoke the resolved entry point; Err carries the script error text.
    Find {
        url: String,
        host: String,
        function: String,
        reply: oneshot::Sender<std::result::Result<String, String>>,
    },
}

struct EnginePool {
    sender: mpsc::Sender<EngineJob>,
}

/// Pooled, sandboxed PAC script evaluator.
///
/// Built once per session; `start` loads and compiles the script,
/// `shutdown` tears the pool down so a later session re-reads the source.
pub struct PacEvaluator {
    location: String,
    pool_size: usize,
    blacklist: Arc<RouteBlacklist>,
    pool: Mutex<Option<EnginePool>>,
    entry_point: ArcSwapOption<String>,
}

impl PacEvaluator {
    pub fn new(location: impl Into<String>, pool_size: usize, blacklist: Arc<RouteBlacklist>) -> Self {
        Self {
            location: location.into(),
            pool_size: pool_size.max(1),
            blacklist,
            pool: Mutex::new(None),
            entry_point: ArcSwapOption::empty(),
        }
    }

    /// Load the PAC source, warm the engine pool and resolve the entry
    /// point. Fails when the source is unreadable, does not compile, or
    /// defines neither entry point.
    pub async fn start(&self) -> Result<()> {
        let source = Arc::new(load_source(&self.location).await?);
        info!("Loaded PAC script from {}", self.location);

        let (sender, receiver) = mpsc::channel(self.pool_size);
        let receiver = Arc::new(Mutex::new(receiver));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        for index in 0..self.pool_size {
            let source = source.clone();
            let receiver = receiver.clone();
            let ready = ready_tx.clone();
            std::thread::Builder::new()
                .name(format!("pac-engine-{}", index))
                .spawn(move || engine_worker(source, receiver, ready))
                .map_err(PorticoError::Io)?;
        }
        drop(ready_tx);

        let pool_size = self.pool_size;
        let readiness = tokio::task::spawn_blocking(move || {
            ready_rx.iter().take(pool_size).collect::<Vec<_>>()
        })
        .await
        .map_err(|e| PorticoError::Internal(e.to_string()))?;

        if let Some(Err(message)) = readiness.into_iter().find(|r| r.is_err()) {
            return Err(PorticoError::PacFile(message));
        }

        let (probe_tx, probe_rx) = oneshot::channel();
        sender
            .send(EngineJob::Probe { reply: probe_tx })
            .await
            .map_err(|_| PorticoError::Internal("PAC engine pool is gone".into()))?;
        let entry_point = probe_rx
            .await
            .map_err(|_| PorticoError::Internal("PAC engine dropped the probe".into()))?
            .ok_or_else(|| {
                PorticoError::PacFile(format!(
                    "Function {} or {} not found in PAC script",
                    STANDARD_ENTRY_POINT, IPV6_AWARE_ENTRY_POINT
                ))
            })?;

        info!("PAC entry point resolved: {}", entry_point);
        self.entry_point
            .store(Some(Arc::new(entry_point.to_string())));
        *self.pool.lock() = Some(EnginePool { sender });
        Ok(())
    }

    /// Drop the pool; workers exit once their in-flight job finishes.
    pub fn shutdown(&self) {
        debug!("Shutting down PAC engine pool");
        self.entry_point.store(None);
        *self.pool.lock() = None;
    }

    pub fn is_started(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Evaluate the script for one target and return the ordered,
    /// blacklist-filtered candidate routes.
    pub async fn find_routes(&self, url: &Url) -> Result<Vec<ProxyRoute>> {
        let function = self.entry_point.load_full().ok_or_else(|| {
            PorticoError::PacFile("PAC evaluator is not started".to_string())
        })?;
        let sender = self
            .pool
            .lock()
            .as_ref()
            .map(|pool| pool.sender.clone())
            .ok_or_else(|| PorticoError::PacFile("PAC evaluator is not started".to_string()))?;

        let host = url
            .host_str()
            .ok_or_else(|| PorticoError::InvalidRequest("URL without host".to_string()))?
            .to_string();

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(EngineJob::Find {
                url: stripped_url(url),
                host,
                function: function.as_ref().clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| PorticoError::Internal("PAC engine pool is gone".into()))?;

        let line = reply_rx
            .await
            .map_err(|_| PorticoError::Internal("PAC engine dropped the request".into()))?
            .map_err(PorticoError::PacScript)?;

        debug!("Parse proxy line [{}] for url [{}]", line, url);
        parse_proxy_line(&line, |route| {
            route.kind.is_direct() || self.blacklist.is_active(route)
        })
        .map_err(|e| PorticoError::PacScript(e.to_string()))
    }
}

/// Clean a URL down to what a PAC script should see: scheme, host and
/// explicit port only. Browsers append the trailing slash, so we do too.
fn stripped_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}://{}:{}/", url.scheme(), host, port),
        None => format!("{}://{}/", url.scheme(), host),
    }
}

async fn load_source(location: &str) -> Result<String> {
    if location.is_empty() {
        return Err(PorticoError::PacFile(
            "No PAC file location configured".to_string(),
        ));
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        fetch_over_http(location).await.map_err(|e| {
            PorticoError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
        })
    } else {
        tokio::fs::read_to_string(location)
            .await
            .map_err(PorticoError::Io)
    }
}

async fn fetch_over_http(location: &str) -> anyhow::Result<String> {
    let uri: hyper::Uri = location.parse()?;
    let client: Client<_, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpsConnector::new());

    let request = http::Request::builder()
        .uri(uri)
        .body(Empty::<Bytes>::new())?;
    let response = client.request(request).await?;
    anyhow::ensure!(
        response.status().is_success(),
        "unexpected status {} fetching PAC file",
        response.status()
    );
    let body = response.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8(body.to_vec())?)
}

fn engine_worker(
    source: Arc<String>,
    jobs: Arc<Mutex<mpsc::Receiver<EngineJob>>>,
    ready: std::sync::mpsc::Sender<std::result::Result<(), String>>,
) {
    let mut context = match build_context(&source) {
        Ok(context) => {
            let _ = ready.send(Ok(()));
            context
        }
        Err(message) => {
            let _ = ready.send(Err(message));
            return;
        }
    };

    loop {
        // Holding the lock only while dequeueing; evaluation runs unlocked.
        let job = { jobs.lock().blocking_recv() };
        let Some(job) = job else { break };
        match job {
            EngineJob::Probe { reply } => {
                let _ = reply.send(resolve_entry_point(&mut context));
            }
            EngineJob::Find {
                url,
                host,
                function,
                reply,
            } => {
                let _ = reply.send(invoke_entry_point(&mut context, &function, &url, &host));
            }
        }
    }
    debug!("PAC engine worker exiting");
}

/// Build one sandboxed engine: console, global allow-list cleanup, the PAC
/// source itself, then the helper bindings.
fn build_context(source: &str) -> std::result::Result<Context, String> {
    let mut context = Context::default();

    let console = Console::init(&mut context);
    context
        .register_global_property(js_string!(Console::NAME), console, Attribute::all())
        .map_err(|e| e.to_string())?;

    let allowed =
        serde_json::to_string(ALLOWED_GLOBALS).map_err(|e| e.to_string())?;
    let cleaner = format!(
        "(function(allowed) {{\n\
         \x20 var names = Object.getOwnPropertyNames(globalThis);\n\
         \x20 MAIN: for (var i = 0; i < names.length; i++) {{\n\
         \x20   for (var j = 0; j < allowed.length; j++) {{\n\
         \x20     if (names[i] === allowed[j]) {{ continue MAIN; }}\n\
         \x20   }}\n\
         \x20   delete globalThis[names[i]];\n\
         \x20 }}\n\
         }})({});",
        allowed
    );
    context
        .eval(Source::from_bytes(cleaner.as_bytes()))
        .map_err(|e| format!("sandbox setup failed: {}", e))?;

    context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| format!("PAC script failed to evaluate: {}", e))?;

    helpers::register_helpers(&mut context).map_err(|e| e.to_string())?;

    Ok(context)
}

fn resolve_entry_point(context: &mut Context) -> Option<&'static str> {
    [IPV6_AWARE_ENTRY_POINT, STANDARD_ENTRY_POINT]
        .into_iter()
        .find(|name| is_function(context, name))
}

fn is_function(context: &mut Context, name: &str) -> bool {
    let probe = format!("typeof {};", name);
    match context.eval(Source::from_bytes(probe.as_bytes())) {
        Ok(value) => value
            .as_string()
            .map(|s| s.to_std_string_escaped() == "function")
            .unwrap_or(false),
        Err(e) => {
            warn!("Error probing for PAC entry point {}: {}", name, e);
            false
        }
    }
}

fn invoke_entry_point(
    context: &mut Context,
    function: &str,
    url: &str,
    host: &str,
) -> std::result::Result<String, String> {
    let callable = context
        .global_object()
        .get(JsString::from(function), context)
        .map_err(|e| e.to_string())?;
    let Some(callable) = callable.as_function() else {
        return Err(format!("{} is not a function", function));
    };

    let result = callable
        .call(
            &JsValue::undefined(),
            &[
                JsValue::from(JsString::from(url)),
                JsValue::from(JsString::from(host)),
            ],
            context,
        )
        .map_err(|e| format!("Error when executing PAC function {}: {}", function, e))?;

    result
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteKind;
    use std::io::Write;

    fn write_pac(dir: &tempfile::TempDir, content: &str) -> String {
        let path = dir.path().join("proxy.pac");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn evaluator(location: String, blacklist: Arc<RouteBlacklist>) -> PacEvaluator {
        PacEvaluator::new(location, 2, blacklist)
    }

    #[tokio::test]
    async fn test_find_routes_parses_directive_line() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_pac(
            &dir,
            r#"function FindProxyForURL(url, host) {
                if (host === "intranet.local") { return "DIRECT"; }
                return "PROXY 10.0.0.1:3128; SOCKS5 10.0.0.2:1080; DIRECT";
            }"#,
        );
        let pac = evaluator(location, Arc::new(RouteBlacklist::disabled()));
        pac.start().await.unwrap();

        let url = Url::parse("http://www.example.com/path").unwrap();
        let routes = pac.find_routes(&url).await.unwrap();
        assert_eq!(
            routes,
            vec![
                ProxyRoute::new(RouteKind::Http, "10.0.0.1", 3128),
                ProxyRoute::new(RouteKind::Socks5, "10.0.0.2", 1080),
                ProxyRoute::direct(),
            ]
        );

        let url = Url::parse("http://intranet.local/").unwrap();
        let routes = pac.find_routes(&url).await.unwrap();
        assert_eq!(routes, vec![ProxyRoute::direct()]);

        pac.shutdown();
    }

    #[tokio::test]
    async fn test_blacklisted_routes_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_pac(
            &dir,
            r#"function FindProxyForURL(url, host) {
                return "PROXY 10.0.0.1:3128; PROXY 10.0.0.9:3128";
            }"#,
        );
        let blacklist = Arc::new(RouteBlacklist::new(Some(std::time::Duration::from_secs(60))));
        blacklist.blacklist(&ProxyRoute::new(RouteKind::Http, "10.0.0.1", 3128));

        let pac = evaluator(location, blacklist);
        pac.start().await.unwrap();

        let url = Url::parse("http://www.example.com/").unwrap();
        let routes = pac.find_routes(&url).await.unwrap();
        assert_eq!(routes, vec![ProxyRoute::new(RouteKind::Http, "10.0.0.9", 3128)]);

        pac.shutdown();
    }

    #[tokio::test]
    async fn test_helpers_are_visible_to_script() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_pac(
            &dir,
            r#"function FindProxyForURL(url, host) {
                if (shExpMatch(host, "*.example.com") && !isPlainHostName(host)
                        && dnsDomainLevels(host) === 2) {
                    return "PROXY 10.1.1.1:8080";
                }
                return "DIRECT";
            }"#,
        );
        let pac = evaluator(location, Arc::new(RouteBlacklist::disabled()));
        pac.start().await.unwrap();

        let url = Url::parse("http://www.example.com/").unwrap();
        let routes = pac.find_routes(&url).await.unwrap();
        assert_eq!(routes, vec![ProxyRoute::new(RouteKind::Http, "10.1.1.1", 8080)]);

        pac.shutdown();
    }

    #[tokio::test]
    async fn test_ipv6_aware_entry_point_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_pac(
            &dir,
            r#"function FindProxyForURL(url, host) { return "DIRECT"; }
               function FindProxyForURLEx(url, host) { return "PROXY 10.2.2.2:8080"; }"#,
        );
        let pac = evaluator(location, Arc::new(RouteBlacklist::disabled()));
        pac.start().await.unwrap();

        let url = Url::parse("http://www.example.com/").unwrap();
        let routes = pac.find_routes(&url).await.unwrap();
        assert_eq!(routes, vec![ProxyRoute::new(RouteKind::Http, "10.2.2.2", 8080)]);

        pac.shutdown();
    }

    #[tokio::test]
    async fn test_missing_entry_point_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_pac(&dir, "function NotTheRightName(url, host) { return 'DIRECT'; }");
        let pac = evaluator(location, Arc::new(RouteBlacklist::disabled()));

        let err = pac.start().await.unwrap_err();
        assert!(matches!(err, PorticoError::PacFile(_)));
        assert!(!pac.is_started());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let pac = evaluator(
            "/definitely/not/here.pac".to_string(),
            Arc::new(RouteBlacklist::disabled()),
        );
        let err = pac.start().await.unwrap_err();
        assert!(matches!(err, PorticoError::Io(_)));
    }

    #[tokio::test]
    async fn test_script_error_at_call_time() {
        let dir = tempfile::tempdir().unwrap();
        let location = write_pac(
            &dir,
            r#"function FindProxyForURL(url, host) { throw "kaboom"; }"#,
        );
        let pac = evaluator(location, Arc::new(RouteBlacklist::disabled()));
        pac.start().await.unwrap();

        let url = Url::parse("http://www.example.com/").unwrap();
        let err = pac.find_routes(&url).await.unwrap_err();
        assert!(matches!(err, PorticoError::PacScript(_)));

        // The pool survives a script error.
        let err = pac.find_routes(&url).await.unwrap_err();
        assert!(matches!(err, PorticoError::PacScript(_)));

        pac.shutdown();
    }

    #[tokio::test]
    async fn test_sandbox_strips_unlisted_globals() {
        let dir = tempfile::tempdir().unwrap();
        // A script that relies on the allow-listed globals still working.
        let location = write_pac(
            &dir,
            r#"function FindProxyForURL(url, host) {
                if (typeof Math.max === "function" && typeof JSON.parse === "function") {
                    return "DIRECT";
                }
                return "PROXY 10.0.0.1:3128";
            }"#,
        );
        let pac = evaluator(location, Arc::new(RouteBlacklist::disabled()));
        pac.start().await.unwrap();

        let url = Url::parse("http://www.example.com/").unwrap();
        let routes = pac.find_routes(&url).await.unwrap();
        assert_eq!(routes, vec![ProxyRoute::direct()]);

        pac.shutdown();
    }

    #[test]
    fn test_stripped_url_hides_path_and_default_port() {
        let url = Url::parse("http://www.example.com/secret/path?q=1").unwrap();
        assert_eq!(stripped_url(&url), "http://www.example.com/");

        let url = Url::parse("http://www.example.com:8080/x").unwrap();
        assert_eq!(stripped_url(&url), "http://www.example.com:8080/");
    }
}
