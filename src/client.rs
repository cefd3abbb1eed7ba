// Copyright 2020 Joyent, Inc.

//! Client facade.
//!
//! A [`Client`] owns the connection pool, the connector and the worker
//! pool, and creates the calls that use them. Clones share all three.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use slog::{info, o, Drain, Logger};

use crate::call::{Call, CallContext};
use crate::connection::{Connector, TlsConnector};
use crate::dispatcher::{Dispatcher, DEFAULT_MAX_WORKER_THREADS};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::multicall::MultiCall;
use crate::pool::{ConnectionPool, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_IDLE_CONNECTIONS};
use crate::provider::{ConnectionProvider, Timeouts};
use crate::request::Request;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESPONSE_SIZE: u32 = 16 * 1024 * 1024;

/// Client settings. Deserializes from any serde format; missing fields
/// take their defaults. Durations are given in milliseconds, and a
/// timeout of `null` waits forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoint for requests that do not name their own.
    pub endpoint: Option<Endpoint>,
    #[serde(with = "optional_millis")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "optional_millis")]
    pub read_timeout: Option<Duration>,
    #[serde(with = "optional_millis")]
    pub write_timeout: Option<Duration>,
    pub max_idle_connections: usize,
    #[serde(with = "millis")]
    pub keep_alive: Duration,
    /// Largest response value section accepted, in bytes.
    pub max_response_size: u32,
    pub max_worker_threads: usize,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            endpoint: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            max_worker_threads: DEFAULT_MAX_WORKER_THREADS,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// A remote method bound at compile time: how to build its request and
/// what its response deserializes into.
pub trait RemoteMethod {
    type Output: DeserializeOwned;

    fn request(&self) -> Request;
}

pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    log: Option<Logger>,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> ClientBuilder {
        self.config = config;
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> ClientBuilder {
        self.config.endpoint = Some(endpoint);
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> ClientBuilder {
        self.config.write_timeout = timeout;
        self
    }

    pub fn max_idle_connections(mut self, max: usize) -> ClientBuilder {
        self.config.max_idle_connections = max;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> ClientBuilder {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn max_response_size(mut self, max: u32) -> ClientBuilder {
        self.config.max_response_size = max;
        self
    }

    pub fn max_worker_threads(mut self, max: usize) -> ClientBuilder {
        self.config.max_worker_threads = max;
        self
    }

    /// Speaks TLS using `config`.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> ClientBuilder {
        self.connector = Some(Arc::new(TlsConnector::new(config)));
        self
    }

    /// Opens connections through `connector` instead of TLS.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> ClientBuilder {
        self.connector = Some(connector);
        self
    }

    pub fn logger(mut self, log: Logger) -> ClientBuilder {
        self.log = Some(log);
        self
    }

    pub fn build(self) -> Result<Client> {
        let connector = self.connector.ok_or_else(|| {
            Error::Config("no TLS configuration or connector given".to_string())
        })?;
        if self.config.max_response_size == 0 {
            return Err(Error::Config("max_response_size must be positive".to_string()));
        }
        let root = self
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let log = root.new(o!("component" => "binrpc"));

        let pool = ConnectionPool::with_logger(
            self.config.max_idle_connections,
            self.config.keep_alive,
            Some(&log),
        );
        let timeouts = Timeouts {
            connect: self.config.connect_timeout,
            read: self.config.read_timeout,
            write: self.config.write_timeout,
        };
        let context = CallContext {
            provider: Arc::new(ConnectionProvider::new(pool, connector, timeouts, &log)),
            dispatcher: Dispatcher::new(self.config.max_worker_threads, &log),
            max_response_size: self.config.max_response_size,
            log: log.clone(),
        };
        info!(log, "client created";
            "endpoint" => self.config.endpoint.as_ref().map(|e| e.to_string()),
            "max_idle_connections" => self.config.max_idle_connections);

        Ok(Client {
            config: Arc::new(self.config),
            context: Arc::new(context),
        })
    }
}

#[derive(Clone)]
pub struct Client {
    config: Arc<ClientConfig>,
    context: Arc<CallContext>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder {
            config: ClientConfig::default(),
            connector: None,
            log: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.context.provider.pool()
    }

    /// A call for `request`, sent to the request's own endpoint or else the
    /// configured one.
    pub fn new_call(&self, request: Request) -> Result<Call> {
        let endpoint = match request.endpoint().or(self.config.endpoint.as_ref()) {
            Some(ep) => ep.clone(),
            None => return Err(Error::NoEndpoint(request.method().to_string())),
        };
        Ok(Call::new(request, endpoint, Arc::clone(&self.context)))
    }

    /// A batch sent to `endpoint`, or else the configured endpoint. Endpoints
    /// named by the requests themselves are ignored: a batch uses one
    /// connection.
    pub fn new_multi_call(
        &self,
        requests: Vec<Request>,
        endpoint: Option<Endpoint>,
    ) -> Result<MultiCall> {
        let endpoint = match endpoint.or_else(|| self.config.endpoint.clone()) {
            Some(ep) => ep,
            None => {
                let method = requests.first().map_or("multi-call", |r| r.method());
                return Err(Error::NoEndpoint(method.to_string()));
            }
        };
        Ok(MultiCall::new(requests, endpoint, Arc::clone(&self.context)))
    }

    /// Executes `method` and deserializes its response values.
    pub fn invoke<M: RemoteMethod>(&self, method: &M) -> Result<M::Output> {
        let mut response = self.new_call(method.request())?.execute()?;
        let output = response.json()?;
        response.close();
        Ok(output)
    }

    /// Closes every pooled connection and stops the worker pool. Calls
    /// already running finish; new asynchronous calls fail.
    pub fn shutdown(&self) {
        self.context.dispatcher.shutdown();
        self.pool().evict_all();
        info!(self.context.log, "client shut down");
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("idle_connections", &self.pool().idle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_logger, MockConnector};
    use serde_json::json;

    fn client(connector: &MockConnector) -> Client {
        Client::builder()
            .endpoint(Endpoint::new("mock", 1))
            .connector(Arc::new(connector.clone()))
            .logger(test_logger())
            .build()
            .unwrap()
    }

    #[test]
    fn config_defaults_and_partial_deserialize() {
        let config: ClientConfig = serde_json::from_value(json!({
            "endpoint": {"host": "rpc.local", "port": 2020},
            "read_timeout": null,
            "keep_alive": 1500
        }))
        .unwrap();
        assert_eq!(config.endpoint, Some(Endpoint::new("rpc.local", 2020)));
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(config.keep_alive, Duration::from_millis(1500));
        assert_eq!(config.max_idle_connections, 5);
        assert_eq!(config.max_response_size, 16 * 1024 * 1024);
    }

    #[test]
    fn build_requires_connector() {
        let res = Client::builder().logger(test_logger()).build();
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn call_without_endpoint_fails() {
        let c = Client::builder()
            .connector(Arc::new(MockConnector::new()))
            .logger(test_logger())
            .build()
            .unwrap();
        assert!(matches!(c.new_call(Request::new("ping")), Err(Error::NoEndpoint(_))));
        assert!(matches!(c.new_multi_call(vec![], None), Err(Error::NoEndpoint(_))));

        let req = Request::builder("ping").endpoint(Endpoint::new("h", 9)).build();
        assert_eq!(c.new_call(req).unwrap().endpoint(), &Endpoint::new("h", 9));
    }

    #[derive(Debug, serde_derive::Deserialize, PartialEq)]
    struct Pong {
        seq: u64,
    }

    struct Ping(u64);

    impl RemoteMethod for Ping {
        type Output = Pong;

        fn request(&self) -> Request {
            Request::builder("ping").param("seq", self.0).build()
        }
    }

    #[test]
    fn invoke_adapts_response_and_recycles() {
        let connector = MockConnector::new();
        connector.add().push_response(&json!({"seq": 4}), None);
        let c = client(&connector);
        assert_eq!(c.invoke(&Ping(4)).unwrap(), Pong { seq: 4 });
        assert_eq!(c.pool().idle_count(), 1);
        c.shutdown();
        assert_eq!(c.pool().idle_count(), 0);
    }

    #[test]
    fn shutdown_rejects_async_calls() {
        let connector = MockConnector::new();
        let c = client(&connector);
        c.shutdown();
        let call = c.new_call(Request::new("ping")).unwrap();
        assert!(matches!(call.enqueue(|_| ()), Err(Error::IllegalState(_))));
    }
}
