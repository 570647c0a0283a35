//! Update-service protocol client
//!
//! Resolves an opaque update identity (plus revision) to a direct file URL by
//! talking SOAP 1.2 to the store's client web service. Requests carry a
//! WS-Security header with a five minute timestamp window and a tickets token:
//! the anonymous ticket is always present, the user ticket only when one was
//! obtained from the native token helper (see [`crate::token`]).
//!
//! # Examples
//!
//! ```no_run
//! use mclauncher::protocol::{ProtocolClient, UrlPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> mclauncher::Result<()> {
//! let client = ProtocolClient::new(mclauncher::protocol::SECURED_ENDPOINT, UrlPolicy::AnyHttp);
//! let http = reqwest::Client::new();
//! let url = client
//!     .resolve(&http, "d25480ca-36aa-46e6-b76b-39608d49558c", "1", &CancellationToken::new())
//!     .await?;
//! println!("{}", url);
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use quick_xml::Writer;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Client web-service endpoint used for file-location requests
pub const SECURED_ENDPOINT: &str =
    "https://fe3.delivery.mp.microsoft.com/ClientWebService/client.asmx/secured";

const SOAP_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const ADDRESSING_NS: &str = "http://www.w3.org/2005/08/addressing";
const SECEXT_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const SECUTIL_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
const TICKETS_NS: &str = "http://schemas.microsoft.com/msus/2014/10/WindowsUpdateAuthorization";
const CLIENT_NS: &str = "http://www.microsoft.com/SoftwareDistribution/Server/ClientWebService";

const FILE_LOCATION_METHOD: &str = "GetExtendedUpdateInfo2";

/// Device description the service uses to pick a compatible response
pub const DEVICE_ATTRIBUTES: &str = "E:BranchReadinessLevel=CBB&DchuNvidiaGrfxExists=1&ProcessorIdentifier=Intel64%20Family%206%20Model%2063%20Stepping%202&CurrentBranch=rs4_release&DataVer_RS5=1942&FlightRing=Retail&AttrDataVer=57&InstallLanguage=en-US&DchuAmdGrfxExists=1&OSUILocale=en-US&InstallationType=Client&FlightingBranchName=&Version_RS5=10&UpgEx_RS5=Green&GStatus_RS5=2&OSSkuId=48&App=WU&InstallDate=1529700913&ProcessorManufacturer=GenuineIntel&AppVer=10.0.17134.471&OSArchitecture=AMD64&UpdateManagementGroup=2&IsDeviceRetailDemo=0&HidOverGattReg=C%3A%5CWINDOWS%5CSystem32%5CDriverStore%5CFileRepository%5Chidbthle.inf_amd64_467f181075371c89%5CMicrosoft.Bluetooth.Profiles.HidOverGatt.dll&IsFlightingEnabled=0&DchuIntelGrfxExists=1&TelemetryLevel=1&DefaultUserRegion=244&DeferFeatureUpdatePeriodInDays=365&Bios=Unknown&WuClientVer=10.0.17134.471&PausedFeatureStatus=1&Steam=URL%3Asteam%20protocol&Free=8to16&OSVersion=10.0.17134.472&DeviceFamily=Windows.Desktop";

/// Which of the returned file URLs may be downloaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UrlPolicy {
    /// First URL with an `http://` or `https://` scheme
    #[default]
    AnyHttp,
    /// First URL starting with the given prefix (e.g. a specific CDN host)
    HostPrefix { prefix: String },
}

impl UrlPolicy {
    pub fn accepts(&self, url: &str) -> bool {
        match self {
            UrlPolicy::AnyHttp => url.starts_with("http://") || url.starts_with("https://"),
            UrlPolicy::HostPrefix { prefix } => url.starts_with(prefix.as_str()),
        }
    }

    pub fn select<'a>(&self, urls: &'a [String]) -> Option<&'a str> {
        urls.iter().map(String::as_str).find(|u| self.accepts(u))
    }
}

/// Builds and parses file-location requests
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    endpoint: String,
    policy: UrlPolicy,
    user_ticket: Option<String>,
}

impl ProtocolClient {
    pub fn new(endpoint: impl Into<String>, policy: UrlPolicy) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy,
            user_ticket: None,
        }
    }

    /// Same client, with a user ticket attached to every request
    pub fn with_user_ticket(mut self, ticket: impl Into<String>) -> Self {
        self.user_ticket = Some(ticket.into());
        self
    }

    pub fn has_user_ticket(&self) -> bool {
        self.user_ticket.is_some()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build the SOAP envelope requesting file locations for an update identity
    pub fn build_download_request(
        &self,
        update_identity: &str,
        revision: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let mut xml = XmlBuilder::new();

        xml.open(
            "s:Envelope",
            &[("xmlns:a", ADDRESSING_NS), ("xmlns:s", SOAP_NS)],
        )?;
        self.write_header(&mut xml, now)?;

        xml.open("s:Body", &[])?;
        xml.open(FILE_LOCATION_METHOD, &[("xmlns", CLIENT_NS)])?;
        xml.open("updateIDs", &[])?;
        xml.open("UpdateIdentity", &[])?;
        xml.text_element("UpdateID", &[], update_identity)?;
        xml.text_element("RevisionNumber", &[], revision)?;
        xml.close("UpdateIdentity")?;
        xml.close("updateIDs")?;
        xml.open("infoTypes", &[])?;
        xml.text_element("XmlUpdateFragmentType", &[], "FileUrl")?;
        xml.close("infoTypes")?;
        xml.text_element("deviceAttributes", &[], DEVICE_ATTRIBUTES)?;
        xml.close(FILE_LOCATION_METHOD)?;
        xml.close("s:Body")?;

        xml.close("s:Envelope")?;
        xml.finish()
    }

    fn write_header(&self, xml: &mut XmlBuilder, now: DateTime<Utc>) -> Result<()> {
        let action = format!("{}/{}", CLIENT_NS, FILE_LOCATION_METHOD);
        let created = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let expires = (now + Duration::minutes(5)).to_rfc3339_opts(SecondsFormat::Millis, true);

        xml.open("s:Header", &[])?;
        xml.text_element("a:Action", &[("s:mustUnderstand", "1")], &action)?;
        xml.text_element("a:MessageID", &[], &message_id())?;
        xml.text_element("a:To", &[("s:mustUnderstand", "1")], &self.endpoint)?;

        xml.open(
            "o:Security",
            &[("s:mustUnderstand", "1"), ("xmlns:o", SECEXT_NS)],
        )?;
        xml.open("wsu:Timestamp", &[("xmlns:wsu", SECUTIL_NS)])?;
        xml.text_element("wsu:Created", &[], &created)?;
        xml.text_element("wsu:Expires", &[], &expires)?;
        xml.close("wsu:Timestamp")?;
        self.write_tickets(xml)?;
        xml.close("o:Security")?;

        xml.close("s:Header")
    }

    fn write_tickets(&self, xml: &mut XmlBuilder) -> Result<()> {
        xml.open(
            "wuws:WindowsUpdateTicketsToken",
            &[
                ("wsu:id", "ClientMSA"),
                ("xmlns:wsu", SECUTIL_NS),
                ("xmlns:wuws", TICKETS_NS),
            ],
        )?;
        if let Some(ticket) = &self.user_ticket {
            xml.open(
                "TicketType",
                &[("Name", "MSA"), ("Version", "1.0"), ("Policy", "MBI_SSL")],
            )?;
            xml.text_element("User", &[], ticket)?;
            xml.close("TicketType")?;
        }
        xml.text_element(
            "TicketType",
            &[("Name", "AAD"), ("Version", "1.0"), ("Policy", "MBI_SSL")],
            "",
        )?;
        xml.close("wuws:WindowsUpdateTicketsToken")
    }

    /// Pick the first acceptable URL according to the configured policy
    pub fn select_url(&self, urls: &[String]) -> Option<String> {
        self.policy.select(urls).map(str::to_string)
    }

    /// Resolve an update identity to a direct download URL
    ///
    /// Returns [`Error::UnresolvableIdentifier`] when the response holds no
    /// acceptable URL, which callers must report differently from transport
    /// errors.
    pub async fn resolve(
        &self,
        http: &reqwest::Client,
        update_identity: &str,
        revision: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = self.build_download_request(update_identity, revision, Utc::now())?;

        let request = http
            .post(&self.endpoint)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .body(body);

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = request.send() => response?,
        };
        let status = response.status();
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            text = response.text() => text?,
        };
        debug!(
            "File location response for {} revision {} (HTTP {}):\n{}",
            update_identity,
            revision,
            status.as_u16(),
            text
        );

        let urls = match extract_download_urls(&text) {
            Ok(urls) => urls,
            Err(e) if !status.is_success() => {
                return Err(Error::Transport(format!(
                    "update service returned HTTP {} ({})",
                    status.as_u16(),
                    e
                )))
            }
            Err(e) => return Err(e),
        };

        match self.select_url(&urls) {
            Some(url) => {
                debug!("Resolved download link: {}", url);
                Ok(url)
            }
            None => Err(Error::UnresolvableIdentifier {
                identifier: update_identity.to_string(),
                beta: false,
            }),
        }
    }
}

fn message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex = hex::encode(bytes);
    format!(
        "urn:uuid:{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Location of every `Url` element in a file-location response
const URL_PATH: [(&str, &str); 7] = [
    (SOAP_NS, "Envelope"),
    (SOAP_NS, "Body"),
    (CLIENT_NS, "GetExtendedUpdateInfo2Response"),
    (CLIENT_NS, "GetExtendedUpdateInfo2Result"),
    (CLIENT_NS, "FileLocations"),
    (CLIENT_NS, "FileLocation"),
    (CLIENT_NS, "Url"),
];

/// Collect all file URLs from a file-location response, in document order
///
/// Elements are matched by namespace URI and local name, so the prefixes the
/// server happens to use do not matter. A response without a result element
/// (for example a SOAP fault) yields an empty list.
pub fn extract_download_urls(xml: &str) -> Result<Vec<String>> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(Option<Vec<u8>>, Vec<u8>)> = Vec::new();
    let mut urls = Vec::new();

    loop {
        let (resolved, event) = reader
            .read_resolved_event()
            .map_err(|e| Error::Xml(e.to_string()))?;
        let namespace = match resolved {
            ResolveResult::Bound(Namespace(ns)) => Some(ns.to_vec()),
            _ => None,
        };

        match event {
            Event::Start(e) => stack.push((namespace, e.local_name().as_ref().to_vec())),
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(t) => {
                if at_url_path(&stack) {
                    let value = t.unescape().map_err(|e| Error::Xml(e.to_string()))?;
                    urls.push(value.into_owned());
                }
            }
            Event::CData(t) => {
                if at_url_path(&stack) {
                    urls.push(String::from_utf8_lossy(&t.into_inner()).into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(urls)
}

fn at_url_path(stack: &[(Option<Vec<u8>>, Vec<u8>)]) -> bool {
    stack.len() == URL_PATH.len()
        && stack
            .iter()
            .zip(URL_PATH.iter())
            .all(|((ns, local), (want_ns, want_local))| {
                ns.as_deref() == Some(want_ns.as_bytes()) && local.as_slice() == want_local.as_bytes()
            })
}

struct XmlBuilder {
    writer: Writer<Vec<u8>>,
}

impl XmlBuilder {
    fn new() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| Error::Xml(e.to_string()))
    }

    fn open(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<()> {
        let start = BytesStart::new(name).with_attributes(attributes.iter().copied());
        self.write(Event::Start(start))
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn text_element(&mut self, name: &str, attributes: &[(&str, &str)], text: &str) -> Result<()> {
        self.open(name, attributes)?;
        if !text.is_empty() {
            self.write(Event::Text(BytesText::new(text)))?;
        }
        self.close(name)
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| Error::Xml(format!("request is not valid UTF-8: {}", e)))
    }
}
