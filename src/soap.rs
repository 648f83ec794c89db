//! SOAP control plumbing: SOAPACTION parsing, envelope handling, response
//! and fault marshalling, and the service registry the dispatcher routes
//! through.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::error::UpnpError;

pub const ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";

pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// A service type URN, e.g.
/// `urn:schemas-upnp-org:service:ContentDirectory:1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrn {
    pub domain: String,
    pub kind: String,
    pub version: u32,
}

impl fmt::Display for ServiceUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:{}:service:{}:{}", self.domain, self.kind, self.version)
    }
}

pub fn parse_service_urn(s: &str) -> Result<ServiceUrn> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        ["urn", domain, "service", kind, version] if !domain.is_empty() && !kind.is_empty() => {
            Ok(ServiceUrn {
                domain: domain.to_string(),
                kind: kind.to_string(),
                version: version
                    .parse()
                    .with_context(|| format!("bad service version in {s:?}"))?,
            })
        }
        _ => bail!("not a service URN: {s:?}"),
    }
}

/// The routing key from a `SOAPACTION` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapAction {
    pub urn: ServiceUrn,
    pub action: String,
}

/// Parses `SOAPACTION: "<service-urn>#<action>"`; the outer quotes are
/// required.
pub fn parse_soap_action(header: &str) -> Result<SoapAction> {
    let header = header.trim();
    let inner = header
        .strip_prefix('"')
        .and_then(|h| h.strip_suffix('"'))
        .with_context(|| format!("SOAPACTION not quoted: {header:?}"))?;
    let (urn, action) = inner
        .rsplit_once('#')
        .with_context(|| format!("SOAPACTION missing '#': {header:?}"))?;
    if action.is_empty() {
        bail!("SOAPACTION has empty action: {header:?}");
    }
    Ok(SoapAction {
        urn: parse_service_urn(urn)?,
        action: action.to_string(),
    })
}

/// Returns the raw XML inside the envelope's `Body` element.
pub fn extract_body(envelope: &str) -> Result<&str> {
    let mut reader = Reader::from_str(envelope);
    loop {
        match reader.read_event().context("malformed SOAP envelope")? {
            Event::Start(e) if e.local_name().as_ref() == b"Body" => {
                let span = reader
                    .read_to_end(e.name())
                    .context("unterminated SOAP Body")?;
                let span = span.start as usize..span.end as usize;
                return Ok(envelope[span].trim());
            }
            Event::Eof => bail!("SOAP envelope has no Body"),
            _ => {}
        }
    }
}

/// Ordered response arguments. Order matters to some renderers, so this
/// is a sequence rather than a map.
pub type OutArgs = Vec<(&'static str, String)>;

/// Per-request facts services may consult.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub host: String,
    pub user_agent: String,
    pub remote: Option<IpAddr>,
}

/// A UPnP SOAP service: one dynamic entry point per action.
#[async_trait]
pub trait UpnpService: Send + Sync {
    async fn handle(
        &self,
        action: &str,
        args_xml: &str,
        ctx: &RequestContext,
    ) -> Result<OutArgs, UpnpError>;
}

/// Service lookup by URN kind (`ContentDirectory`, ...).
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn UpnpService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, service: Arc<dyn UpnpService>) {
        self.services.insert(kind.to_string(), service);
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn UpnpService>> {
        self.services.get(kind)
    }
}

fn render_response_body(action: &SoapAction, args: &OutArgs) -> String {
    let mut out = format!(
        r#"<u:{action}Response xmlns:u="{urn}">"#,
        action = action.action,
        urn = action.urn
    );
    for (name, value) in args {
        out.push_str(&format!("<{name}>{}</{name}>", xml_escape(value)));
    }
    out.push_str(&format!("</u:{}Response>", action.action));
    out
}

fn render_fault_body(err: &UpnpError) -> String {
    format!(
        concat!(
            "<s:Fault>",
            "<faultcode>s:Client</faultcode>",
            "<faultstring>UPnPError</faultstring>",
            "<detail>",
            r#"<UPnPError xmlns="urn:schemas-upnp-org:control-1-0">"#,
            "<errorCode>{code}</errorCode>",
            "<errorDescription>{desc}</errorDescription>",
            "</UPnPError>",
            "</detail>",
            "</s:Fault>"
        ),
        code = err.code,
        desc = xml_escape(&err.description)
    )
}

fn render_envelope(body: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>"#,
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"s:encodingStyle="{style}">"#,
            "<s:Body>{body}</s:Body>",
            "</s:Envelope>"
        ),
        style = ENCODING_STYLE,
        body = body
    )
}

/// Outcome of a control invocation, ready to write as HTTP.
pub struct ControlResponse {
    pub status: u16,
    pub body: String,
}

/// Runs one SOAP control request end to end: routing, service dispatch and
/// envelope marshalling. Protocol-level parse failures surface as `Err`
/// and become plain HTTP 400s.
pub async fn handle_control(
    registry: &ServiceRegistry,
    soap_action_header: &str,
    request_body: &str,
    ctx: &RequestContext,
) -> Result<ControlResponse> {
    let action = parse_soap_action(soap_action_header)?;
    let args_xml = extract_body(request_body)?;

    let result = match registry.get(&action.urn.kind) {
        Some(service) => service.handle(&action.action, args_xml, ctx).await,
        None => Err(UpnpError::invalid_action()),
    };

    Ok(match result {
        Ok(args) => ControlResponse {
            status: 200,
            body: render_envelope(&render_response_body(&action, &args)),
        },
        Err(err) => {
            debug!(
                action = %action.action,
                service = %action.urn.kind,
                code = err.code,
                "soap fault: {}",
                err.description
            );
            ControlResponse {
                status: 500,
                body: render_envelope(&render_fault_body(&err)),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CDS_URN: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";

    #[test]
    fn parses_soap_action_header() {
        let sa = parse_soap_action(&format!("\"{CDS_URN}#Browse\"")).unwrap();
        assert_eq!(sa.action, "Browse");
        assert_eq!(sa.urn.kind, "ContentDirectory");
        assert_eq!(sa.urn.version, 1);
        assert_eq!(sa.urn.to_string(), CDS_URN);
    }

    #[test]
    fn rejects_malformed_action_headers() {
        assert!(parse_soap_action(&format!("{CDS_URN}#Browse")).is_err());
        assert!(parse_soap_action("\"no-hash-here\"").is_err());
        assert!(parse_soap_action(&format!("\"{CDS_URN}#\"")).is_err());
        assert!(parse_soap_action("\"urn:bogus#Browse\"").is_err());
    }

    #[test]
    fn microsoft_urns_parse() {
        let urn =
            parse_service_urn("urn:microsoft.com:service:X_MS_MediaReceiverRegistrar:1").unwrap();
        assert_eq!(urn.domain, "microsoft.com");
        assert_eq!(urn.kind, "X_MS_MediaReceiverRegistrar");
    }

    #[test]
    fn extracts_body_action_xml() {
        let envelope = format!(
            concat!(
                r#"<?xml version="1.0"?>"#,
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">"#,
                "<s:Body>",
                r#"<u:Browse xmlns:u="{urn}"><ObjectID>0</ObjectID></u:Browse>"#,
                "</s:Body></s:Envelope>"
            ),
            urn = CDS_URN
        );
        let inner = extract_body(&envelope).unwrap();
        assert!(inner.starts_with("<u:Browse"));
        assert!(inner.contains("<ObjectID>0</ObjectID>"));
        assert!(extract_body("<not-an-envelope/>").is_err());
    }

    struct EchoService;

    #[async_trait]
    impl UpnpService for EchoService {
        async fn handle(
            &self,
            action: &str,
            _args_xml: &str,
            _ctx: &RequestContext,
        ) -> Result<OutArgs, UpnpError> {
            match action {
                "Ping" => Ok(vec![("First", "1 < 2".to_string()), ("Second", "b".to_string())]),
                _ => Err(UpnpError::invalid_action()),
            }
        }
    }

    fn registry() -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        registry.register("ContentDirectory", Arc::new(EchoService));
        registry
    }

    #[tokio::test]
    async fn success_response_preserves_arg_order() {
        let resp = handle_control(
            &registry(),
            &format!("\"{CDS_URN}#Ping\""),
            &format!(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:Ping xmlns:u="{CDS_URN}"/></s:Body></s:Envelope>"#
            ),
            &RequestContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.body.contains("<u:PingResponse"));
        let first = resp.body.find("<First>").unwrap();
        let second = resp.body.find("<Second>").unwrap();
        assert!(first < second);
        assert!(resp.body.contains("<First>1 &lt; 2</First>"));
    }

    #[tokio::test]
    async fn unknown_action_yields_fault() {
        let resp = handle_control(
            &registry(),
            &format!("\"{CDS_URN}#Explode\""),
            &format!(
                r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:Explode xmlns:u="{CDS_URN}"/></s:Body></s:Envelope>"#
            ),
            &RequestContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 500);
        assert!(resp.body.contains("<errorCode>401</errorCode>"));
        assert!(resp.body.contains("UPnPError"));
    }

    #[tokio::test]
    async fn unknown_service_yields_invalid_action() {
        let resp = handle_control(
            &registry(),
            "\"urn:schemas-upnp-org:service:AVTransport:1#Play\"",
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:Play/></s:Body></s:Envelope>"#,
            &RequestContext::default(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 500);
        assert!(resp.body.contains("<errorCode>401</errorCode>"));
    }

    #[tokio::test]
    async fn malformed_header_is_a_protocol_error() {
        let err = handle_control(
            &registry(),
            "unquoted#Browse",
            "<whatever/>",
            &RequestContext::default(),
        )
        .await;
        assert!(err.is_err());
    }
}
