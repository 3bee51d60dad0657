use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use super::header::{append_query, Method, RequestHeader, Scheme};
use crate::{
    protocol::{
        codes::{http_diagnostic, HttpOutcome},
        device::{Accept, CommandLease, DeviceController},
        error::{ModemError, Result},
        response::{Field, Grammar, ResponseFrame},
        transport::PassthroughGuard,
    },
    utils::escape_bytes,
};

const CONNECT_PROMPT: &[u8] = b"CONNECT\r\n";
const BODY_END: &[u8] = b"\r\nOK\r\n";

const QHTTPGET: Grammar = Grammar::new(
    "+QHTTPGET",
    &[
        Field::int("err"),
        Field::int("status").opt(),
        Field::int("length").opt(),
    ],
);
const QHTTPPOST: Grammar = Grammar::new(
    "+QHTTPPOST",
    &[
        Field::int("err"),
        Field::int("status").opt(),
        Field::int("length").opt(),
    ],
);
const QHTTPREAD: Grammar = Grammar::new("+QHTTPREAD", &[Field::int("err")]);
const QHTTPREADFILE: Grammar = Grammar::new(
    "+QHTTPREADFILE",
    &[Field::int("err"), Field::int("length").opt()],
);

/// Seconds the modem waits for URL, header or body input after `CONNECT`.
const INPUT_TIME_S: u16 = 80;

/// Modem-side HTTP settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSettings {
    /// PDP context the HTTP stack uses
    #[serde(default = "default_context_id")]
    pub context_id: u8,
    /// Security context used for https
    #[serde(default = "default_ssl_context_id")]
    pub ssl_context_id: u8,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Server response time budget in seconds
    #[serde(default = "default_response_timeout_s")]
    pub response_timeout_s: u16,
    /// Send the request line and headers ourselves instead of letting the modem build them
    #[serde(default)]
    pub request_header_mode: bool,
}

fn default_context_id() -> u8 {
    1
}

fn default_ssl_context_id() -> u8 {
    1
}

fn default_user_agent() -> String {
    format!("atmux/{}", env!("CARGO_PKG_VERSION"))
}

fn default_response_timeout_s() -> u16 {
    60
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            context_id: default_context_id(),
            ssl_context_id: default_ssl_context_id(),
            user_agent: default_user_agent(),
            response_timeout_s: default_response_timeout_s(),
            request_header_mode: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpTiming {
    pub command: Duration,
    pub prompt: Duration,
    /// Added to the server response budget when waiting for a result frame.
    pub margin: Duration,
    /// Body transfer of `retrieve_*`.
    pub read: Duration,
}

impl Default for HttpTiming {
    fn default() -> Self {
        Self {
            command: Duration::from_millis(800),
            prompt: Duration::from_secs(5),
            margin: Duration::from_secs(5),
            read: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub outcome: HttpOutcome,
    pub content_length: Option<usize>,
}

/// HTTP(S) requests through the modem's embedded HTTP stack.
pub struct HttpClient {
    device: Arc<DeviceController>,
    settings: HttpSettings,
    timing: HttpTiming,
    configured: Mutex<Option<Scheme>>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    pub fn new(device: Arc<DeviceController>, settings: HttpSettings, timing: HttpTiming) -> Self {
        Self {
            device,
            settings,
            timing,
            configured: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Forget the applied configuration so the next request reapplies it.
    pub fn invalidate(&self) {
        *self.configured.lock() = None;
    }

    pub fn get(&self, header: &RequestHeader) -> Result<HttpResponse> {
        let url = header.url()?;
        let lease = self.device.lease()?;
        self.configure(&lease, header.scheme)?;
        self.set_url(&lease, url.as_str())?;

        let rsp = self.settings.response_timeout_s;
        if self.settings.request_header_mode {
            let head = header.render(Method::Get, &url, &self.settings.user_agent, None);
            lease.execute(&format!("AT+QHTTPGET={rsp},{},{INPUT_TIME_S}", head.len()))?;
            self.stream(&lease, head.as_bytes())?;
        } else {
            lease.command(&format!("AT+QHTTPGET={rsp}"), self.timing.command)?;
        }
        self.await_result(&lease, &QHTTPGET)
    }

    /// POST `body` as-is.
    pub fn post(&self, header: &RequestHeader, body: &[u8]) -> Result<HttpResponse> {
        if body.is_empty() {
            return Err(ModemError::invalid("empty POST body"));
        }
        self.send_post(header, &header.url()?, body)
    }

    /// POST with `params` appended to the URL query and no body.
    pub fn post_params<K: AsRef<str>, V: AsRef<str>>(
        &self,
        header: &RequestHeader,
        params: &[(K, V)],
    ) -> Result<HttpResponse> {
        let mut url = header.url()?;
        append_query(&mut url, params);
        self.send_post(header, &url, &[])
    }

    fn send_post(&self, header: &RequestHeader, url: &Url, body: &[u8]) -> Result<HttpResponse> {
        let lease = self.device.lease()?;
        self.configure(&lease, header.scheme)?;
        // QHTTPPOST takes at least one byte, so an empty body goes out behind our own head
        let own_head = self.settings.request_header_mode || body.is_empty();
        if own_head && !self.settings.request_header_mode {
            lease.command("AT+QHTTPCFG=\"requestheader\",1", self.timing.command)?;
            self.invalidate();
        }
        self.set_url(&lease, url.as_str())?;

        let mut data = Vec::with_capacity(body.len());
        if own_head {
            data.extend_from_slice(
                header
                    .render(Method::Post, url, &self.settings.user_agent, Some(body.len()))
                    .as_bytes(),
            );
        }
        data.extend_from_slice(body);
        lease.execute(&format!(
            "AT+QHTTPPOST={},{INPUT_TIME_S},{}",
            data.len(),
            self.settings.response_timeout_s
        ))?;
        self.stream(&lease, &data)?;
        self.await_result(&lease, &QHTTPPOST)
    }

    /// Read the last response body as text. The transport's trailing `OK`
    /// is trimmed. Notification parsing is suspended for the transfer and
    /// the body may be larger than the receive buffer.
    pub fn retrieve_string(&self) -> Result<String> {
        let lease = self.device.lease()?;
        let token = lease.token();
        let body = {
            let _raw = PassthroughGuard::new(self.device.transport());
            lease.execute(&format!("AT+QHTTPREAD={}", self.timing.read.as_secs().max(1)))?;
            self.device
                .wait_prompt(token, CONNECT_PROMPT, self.timing.prompt)?;
            self.device
                .read_stream_until(token, BODY_END, self.timing.read)?
        };
        self.read_status(&lease)?;
        String::from_utf8(body.to_vec())
            .map_err(|_| ModemError::malformed(format!("body is not utf-8: {}", escape_bytes(&body))))
    }

    /// Copy exactly `len` body bytes into `sink`, with notification parsing
    /// suspended for the transfer.
    pub fn retrieve_into(&self, sink: &mut [u8], len: usize) -> Result<usize> {
        if sink.len() < len {
            return Err(ModemError::invalid(format!(
                "sink of {} bytes for a {len} byte body",
                sink.len()
            )));
        }
        let lease = self.device.lease()?;
        let token = lease.token();
        let chunk = (self.device.transport().config().buffer_capacity / 2).max(1);
        {
            let _raw = PassthroughGuard::new(self.device.transport());
            lease.execute(&format!("AT+QHTTPREAD={}", self.timing.read.as_secs().max(1)))?;
            self.device
                .wait_prompt(token, CONNECT_PROMPT, self.timing.prompt)?;
            let mut copied = 0;
            while copied < len {
                let want = chunk.min(len - copied);
                let bytes = self.device.read_exact(token, want, self.timing.read)?;
                sink[copied..copied + bytes.len()].copy_from_slice(&bytes);
                copied += bytes.len();
            }
            self.device.read_reply(token, self.timing.prompt)?;
        }
        self.read_status(&lease)?;
        Ok(len)
    }

    /// Have the modem write the last response body into its own storage.
    pub fn retrieve_to_storage(&self, file: &str) -> Result<Option<usize>> {
        if file.is_empty() || file.contains('"') {
            return Err(ModemError::invalid(format!("file name {file:?}")));
        }
        let lease = self.device.lease()?;
        let path = if file.contains(':') {
            file.to_string()
        } else {
            format!("UFS:{file}")
        };
        lease.command(
            &format!("AT+QHTTPREADFILE=\"{path}\",{}", self.timing.read.as_secs().max(1)),
            self.timing.command,
        )?;
        let frame = self.device.wait_frame(
            lease.token(),
            &QHTTPREADFILE,
            self.timing.read + self.timing.margin,
            |_| Accept::Take,
        )?;
        http_diagnostic(frame.get("err")?)?;
        let length = frame.opt_int("length")?.and_then(|n| usize::try_from(n).ok());
        log::info!("HTTP body stored in {path}");
        Ok(length)
    }

    fn configure(&self, lease: &CommandLease<'_>, scheme: Scheme) -> Result<()> {
        let mut configured = self.configured.lock();
        if *configured == Some(scheme) {
            return Ok(());
        }
        let s = &self.settings;
        let mut commands = vec![
            format!("AT+QHTTPCFG=\"contextid\",{}", s.context_id),
            "AT+QHTTPCFG=\"responseheader\",0".to_string(),
            format!("AT+QHTTPCFG=\"requestheader\",{}", u8::from(s.request_header_mode)),
        ];
        if scheme.is_secure() {
            let ssl = s.ssl_context_id;
            commands.push(format!("AT+QHTTPCFG=\"sslctxid\",{ssl}"));
            commands.push(format!("AT+QSSLCFG=\"sslversion\",{ssl},4"));
            commands.push(format!("AT+QSSLCFG=\"ciphersuite\",{ssl},0xFFFF"));
            commands.push(format!("AT+QSSLCFG=\"seclevel\",{ssl},0"));
        }
        for command in &commands {
            lease.command(command, self.timing.command)?;
        }
        *configured = Some(scheme);
        Ok(())
    }

    fn set_url(&self, lease: &CommandLease<'_>, url: &str) -> Result<()> {
        lease.execute(&format!("AT+QHTTPURL={},{INPUT_TIME_S}", url.len()))?;
        self.stream(lease, url.as_bytes())
    }

    /// Wait for `CONNECT`, write `data`, then read the `OK`.
    fn stream(&self, lease: &CommandLease<'_>, data: &[u8]) -> Result<()> {
        let token = lease.token();
        self.device
            .wait_prompt(token, CONNECT_PROMPT, self.timing.prompt)?;
        self.device.execute_payload(data, token)?;
        self.device.read_reply(token, self.timing.prompt)?;
        Ok(())
    }

    fn await_result(&self, lease: &CommandLease<'_>, grammar: &Grammar) -> Result<HttpResponse> {
        let timeout = Duration::from_secs(u64::from(self.settings.response_timeout_s)) + self.timing.margin;
        let frame = self
            .device
            .wait_frame(lease.token(), grammar, timeout, |_| Accept::Take)
            .inspect_err(|e| {
                if !matches!(e, ModemError::VendorRejected { .. }) {
                    self.invalidate();
                }
            })?;
        let response = evaluate(&frame)?;
        log::info!("{} -> {} ({:?})", grammar.label, response.status, response.outcome);
        match response.outcome {
            HttpOutcome::Ok => Ok(response),
            _ => Err(ModemError::HttpRejected {
                status: response.status,
            }),
        }
    }

    fn read_status(&self, lease: &CommandLease<'_>) -> Result<()> {
        let frame = self
            .device
            .wait_frame(lease.token(), &QHTTPREAD, self.timing.prompt, |_| Accept::Take)?;
        http_diagnostic(frame.get("err")?)
    }
}

fn evaluate(frame: &ResponseFrame) -> Result<HttpResponse> {
    http_diagnostic(frame.get("err")?)?;
    let status: u16 = match frame.opt_int("status")? {
        Some(code) => u16::try_from(code)
            .map_err(|_| ModemError::malformed(format!("http status {code}")))?,
        None => return Err(ModemError::malformed(format!("{} without status", frame.label()))),
    };
    Ok(HttpResponse {
        status,
        outcome: HttpOutcome::from_status(status),
        content_length: frame.opt_int("length")?.and_then(|n| usize::try_from(n).ok()),
    })
}
