use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::http::{Headers, Method};
use esp_idf_svc::io::{Read, Write};
use node_core::portal::{self, ConfigPortal};

/// Routes registered with the HTTP server; everything else hits the
/// wildcard handler and gets the portal's 404
const ROUTES: [(&str, Method); 5] = [
    ("/", Method::Get),
    ("/scan", Method::Get),
    ("/sysinfo", Method::Get),
    ("/save", Method::Post),
    ("/ota/check", Method::Post),
];

/// Setup portal on esp_http_server; each handler hands the request to
/// [`ConfigPortal::handle`]
pub struct PortalServer {
    portal: Arc<ConfigPortal>,
    server: Mutex<Option<EspHttpServer<'static>>>,
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
        _ => "OTHER",
    }
}

fn read_body(req: &mut Request<&mut EspHttpConnection>) -> Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    // one byte over the cap is enough for the portal to answer 413
    let take = len.min(portal::MAX_BODY_BYTES + 1);
    let mut body = vec![0u8; take];
    if take > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn serve(portal: &ConfigPortal, method: Method, mut req: Request<&mut EspHttpConnection>) -> Result<()> {
    let path = req.uri().split('?').next().unwrap_or("/").to_string();
    let body = read_body(&mut req)?;

    let mut request = portal::Request::new(method_name(method), &path, &body);
    if let Some(content_type) = req.header("Content-Type") {
        request.headers.push(("Content-Type".to_string(), content_type.to_string()));
    }
    log::debug!("Portal {} {}", request.method, request.path);

    let response = portal.handle(&request);
    req.into_response(
        response.status,
        None,
        &[
            ("Content-Type", response.content_type),
            ("Cache-Control", "no-store"),
        ],
    )?
    .write_all(&response.body)?;
    Ok(())
}

impl PortalServer {
    pub fn new(portal: Arc<ConfigPortal>) -> Self {
        Self {
            portal,
            server: Mutex::new(None),
        }
    }

    /// Start serving; a second call is a no-op
    pub fn start(&self) -> Result<()> {
        let mut running = self
            .server
            .lock()
            .map_err(|_| anyhow!("portal server lock poisoned"))?;
        if running.is_some() {
            return Ok(());
        }

        let conf = Configuration {
            // /save waits for the station inside the handler
            stack_size: 10 * 1024,
            uri_match_wildcard: true,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        for (path, method) in ROUTES {
            let portal = self.portal.clone();
            server.fn_handler::<anyhow::Error, _>(path, method, move |req| {
                serve(&portal, method, req)
            })?;
        }
        // registered last so the exact routes match first
        for method in [Method::Get, Method::Post] {
            let portal = self.portal.clone();
            server.fn_handler::<anyhow::Error, _>("/*", method, move |req| {
                serve(&portal, method, req)
            })?;
        }

        if let Ok(mut machine) = self.portal.connectivity().lock() {
            machine.set_portal_serving(true);
        }
        *running = Some(server);
        log::info!("Setup portal listening on port {}", conf.http_port);
        Ok(())
    }
}
