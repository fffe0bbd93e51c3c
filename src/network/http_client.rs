use std::io;
use std::time::Duration;

use embedded_svc::http::client::Connection;
use embedded_svc::http::Method;
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection};
use node_core::fetcher::{HttpResponse, HttpTransport};
use node_core::NetworkError;

/// HTTPS GETs through esp_http_client, verified against the bundled CA set
pub struct EspTransport {
    config: HttpConfig,
    conn: Option<EspHttpConnection>,
}

impl EspTransport {
    pub fn new() -> Self {
        Self {
            config: HttpConfig {
                buffer_size: Some(4096),
                buffer_size_tx: Some(1024),
                timeout: Some(Duration::from_secs(30)),
                crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
                ..Default::default()
            },
            conn: None,
        }
    }
}

/// std::io view of the response body
struct BodyReader<'a> {
    conn: &'a mut EspHttpConnection,
}

impl io::Read for BodyReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        embedded_svc::io::Read::read(self.conn, buf).map_err(|e| io::Error::other(format!("{:?}", e)))
    }
}

impl HttpTransport for EspTransport {
    fn get<'a>(
        &'a mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse<'a>, NetworkError> {
        // a fresh connection per request; the previous body is finished by now
        self.conn = None;
        let mut conn = EspHttpConnection::new(&self.config)
            .map_err(|e| NetworkError::transport(url, e.to_string()))?;

        conn.initiate_request(Method::Get, url, headers)
            .map_err(|e| NetworkError::transport(url, e.to_string()))?;
        conn.initiate_response()
            .map_err(|e| NetworkError::transport(url, e.to_string()))?;
        let status = conn.status();
        log::debug!("GET {} -> {}", url, status);

        let conn = self.conn.insert(conn);
        Ok(HttpResponse {
            status,
            body: Box::new(BodyReader { conn }),
        })
    }
}
