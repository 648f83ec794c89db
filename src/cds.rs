//! The ContentDirectory service: Browse and friends, item resource
//! building and DIDL-Lite rendering. The two small interop services
//! (MediaReceiverRegistrar, ConnectionManager) live at the bottom.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::cache::CachedProbe;
use crate::dlna::{format_duration_sexagesimal, ContentFeatures};
use crate::dynamic;
use crate::error::UpnpError;
use crate::mime::MimeCategory;
use crate::object::{self, query_escape, Entry};
use crate::server::ServerCore;
use crate::soap::{xml_escape, OutArgs, RequestContext, UpnpService};
use crate::transcode;

/// User agents carrying this token want folders sorted after files.
const FOLDERS_LAST_UA: &str = "AwoX/1.1";

#[derive(Debug, Deserialize)]
struct BrowseRequest {
    #[serde(rename = "ObjectID", default)]
    object_id: String,
    #[serde(rename = "BrowseFlag", default)]
    browse_flag: String,
    #[serde(rename = "StartingIndex", default)]
    starting_index: usize,
    #[serde(rename = "RequestedCount", default)]
    requested_count: usize,
}

/// One playable endpoint on an item.
#[derive(Debug, Clone)]
struct DidlResource {
    url: String,
    protocol_info: String,
    size: Option<u64>,
    bitrate: Option<u64>,
    duration: Option<String>,
    resolution: Option<String>,
}

#[derive(Debug, Clone)]
enum DidlObject {
    Container {
        id: String,
        parent_id: String,
        title: String,
        child_count: usize,
    },
    Item {
        id: String,
        parent_id: String,
        title: String,
        class: String,
        icon: Option<String>,
        artist: Option<String>,
        album: Option<String>,
        genre: Option<String>,
        resources: Vec<DidlResource>,
    },
}

fn render_resource(res: &DidlResource) -> String {
    let mut out = format!(r#"<res protocolInfo="{}""#, xml_escape(&res.protocol_info));
    if let Some(size) = res.size {
        out.push_str(&format!(r#" size="{size}""#));
    }
    if let Some(bitrate) = res.bitrate {
        out.push_str(&format!(r#" bitrate="{bitrate}""#));
    }
    if let Some(duration) = &res.duration {
        out.push_str(&format!(r#" duration="{}""#, xml_escape(duration)));
    }
    if let Some(resolution) = &res.resolution {
        out.push_str(&format!(r#" resolution="{}""#, xml_escape(resolution)));
    }
    out.push_str(&format!(">{}</res>", xml_escape(&res.url)));
    out
}

fn render_object(obj: &DidlObject) -> String {
    match obj {
        DidlObject::Container {
            id,
            parent_id,
            title,
            child_count,
        } => format!(
            concat!(
                r#"<container id="{id}" parentID="{parent}" restricted="1" childCount="{count}">"#,
                "<dc:title>{title}</dc:title>",
                "<upnp:class>object.container.storageFolder</upnp:class>",
                "</container>"
            ),
            id = xml_escape(id),
            parent = xml_escape(parent_id),
            count = child_count,
            title = xml_escape(title),
        ),
        DidlObject::Item {
            id,
            parent_id,
            title,
            class,
            icon,
            artist,
            album,
            genre,
            resources,
        } => {
            let mut out = format!(
                concat!(
                    r#"<item id="{id}" parentID="{parent}" restricted="1">"#,
                    "<dc:title>{title}</dc:title>",
                    "<upnp:class>{class}</upnp:class>"
                ),
                id = xml_escape(id),
                parent = xml_escape(parent_id),
                title = xml_escape(title),
                class = xml_escape(class),
            );
            if let Some(artist) = artist {
                out.push_str(&format!("<upnp:artist>{}</upnp:artist>", xml_escape(artist)));
            }
            if let Some(album) = album {
                out.push_str(&format!("<upnp:album>{}</upnp:album>", xml_escape(album)));
            }
            if let Some(genre) = genre {
                out.push_str(&format!("<upnp:genre>{}</upnp:genre>", xml_escape(genre)));
            }
            if let Some(icon) = icon {
                out.push_str(&format!("<upnp:icon>{}</upnp:icon>", xml_escape(icon)));
                out.push_str(&format!(
                    "<upnp:albumArtURI>{}</upnp:albumArtURI>",
                    xml_escape(icon)
                ));
            }
            for res in resources {
                out.push_str(&render_resource(res));
            }
            out.push_str("</item>");
            out
        }
    }
}

/// Wraps rendered objects in the DIDL-Lite envelope with its four
/// canonical namespaces.
fn didl_lite(chardata: &str) -> String {
    format!(
        concat!(
            r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/""#,
            r#" xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/""#,
            r#" xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/""#,
            r#" xmlns:dlna="urn:schemas-dlna-org:metadata-1-0/">"#,
            "{}",
            "</DIDL-Lite>"
        ),
        chardata
    )
}

pub struct ContentDirectoryService {
    core: Arc<ServerCore>,
}

impl ContentDirectoryService {
    pub fn new(core: Arc<ServerCore>) -> Self {
        Self { core }
    }

    fn res_url(&self, host: &str, path: &str, extra: &[(&str, &str)]) -> String {
        let mut url = format!("http://{host}/res?path={}", query_escape(path));
        for (key, value) in extra {
            url.push_str(&format!("&{key}={}", query_escape(value)));
        }
        url
    }

    fn icon_url(&self, host: &str, path: &str) -> String {
        format!("http://{host}/icon?path={}&c=jpeg", query_escape(path))
    }

    fn transcode_resources(
        &self,
        host: &str,
        path: &str,
        resolution: Option<&str>,
        duration: Option<&str>,
    ) -> Vec<DidlResource> {
        transcode::advertised(self.core.config.force_transcode_to.as_deref())
            .into_iter()
            .map(|spec| DidlResource {
                url: self.res_url(host, path, &[("transcode", spec.key)]),
                protocol_info: format!(
                    "http-get:*:{}:{}",
                    spec.mime_type,
                    ContentFeatures {
                        profile_name: spec.dlna_profile.map(str::to_owned),
                        support_time_seek: true,
                        transcoded: true,
                        ..Default::default()
                    }
                ),
                size: None,
                bitrate: None,
                duration: duration.map(str::to_owned),
                resolution: resolution.map(str::to_owned),
            })
            .collect()
    }

    fn dynamic_item(&self, entry: &Entry, host: &str) -> DidlObject {
        let descriptor = dynamic::load(&entry.fs_path).ok();
        let title = descriptor
            .as_ref()
            .and_then(|d| d.title.clone())
            .or_else(|| dynamic::title_from_path(&entry.fs_path))
            .unwrap_or_else(|| entry.name.clone());
        let resources: Vec<DidlResource> = descriptor
            .map(|d| d.resources)
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(index, res)| DidlResource {
                url: self.res_url(host, &entry.object.path, &[("index", &index.to_string())]),
                protocol_info: format!(
                    "http-get:*:{}:{}",
                    res.mime_type,
                    ContentFeatures {
                        profile_name: res.dlna_profile.clone(),
                        support_time_seek: true,
                        transcoded: true,
                        ..Default::default()
                    }
                ),
                size: None,
                bitrate: res.bitrate,
                duration: res
                    .duration
                    .map(|secs| format_duration_sexagesimal(std::time::Duration::from_secs_f64(secs))),
                resolution: res.resolution.clone(),
            })
            .collect();
        let class = resources
            .first()
            .and_then(|r| r.protocol_info.split(':').nth(2))
            .and_then(|m| m.split('/').next())
            .map(|t| match t {
                "audio" => "object.item.audioItem",
                "image" => "object.item.imageItem",
                _ => "object.item.videoItem",
            })
            .unwrap_or("object.item.videoItem");
        DidlObject::Item {
            id: entry.object.id(),
            parent_id: entry.object.parent_id(),
            title,
            class: class.to_string(),
            icon: None,
            artist: None,
            album: None,
            genre: None,
            resources,
        }
    }

    /// Turns a filtered directory entry into a DIDL object, probing items
    /// through the cache for best-effort metadata.
    async fn entry_to_didl(&self, entry: &Entry, host: &str) -> DidlObject {
        if entry.is_dir {
            return DidlObject::Container {
                id: entry.object.id(),
                parent_id: entry.object.parent_id(),
                title: entry.name.clone(),
                child_count: self.core.model.child_count(&entry.object),
            };
        }
        if entry.dynamic {
            return self.dynamic_item(entry, host);
        }

        let mime = entry.mime.as_ref();
        let category = mime.map(|m| m.category()).unwrap_or(MimeCategory::Other);
        let class = format!("object.item.{}Item", category.as_str());
        let probe: CachedProbe = self.core.probe_file(&entry.fs_path).await;

        let bitrate = probe.as_ref().and_then(|p| p.bitrate());
        let duration = probe
            .as_ref()
            .and_then(|p| p.duration())
            .map(format_duration_sexagesimal);
        let resolution = probe.as_ref().and_then(|p| p.resolution());
        let tag = |name: &str| {
            probe
                .as_ref()
                .and_then(|p| p.tag(name))
                .map(str::to_owned)
        };

        let mime_str = mime
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let mut resources = vec![DidlResource {
            url: self.res_url(host, &entry.object.path, &[]),
            protocol_info: format!(
                "http-get:*:{mime_str}:{}",
                ContentFeatures {
                    support_range: true,
                    ..Default::default()
                }
            ),
            size: Some(entry.size),
            bitrate,
            duration: duration.clone(),
            resolution: resolution.clone(),
        }];

        if category == MimeCategory::Video && !self.core.config.no_transcode {
            resources.extend(self.transcode_resources(
                host,
                &entry.object.path,
                resolution.as_deref(),
                duration.as_deref(),
            ));
        }
        if let Some(subtitle) = subtitle_sibling(&entry.fs_path, &entry.object.path) {
            resources.push(DidlResource {
                url: format!("http://{host}/subtitle?path={}", query_escape(&subtitle)),
                protocol_info: "http-get:*:text/plain:*".to_string(),
                size: None,
                bitrate: None,
                duration: None,
                resolution: None,
            });
        }
        let icon = self.icon_url(host, &entry.object.path);
        resources.push(DidlResource {
            url: icon.clone(),
            protocol_info: "http-get:*:image/jpeg:DLNA.ORG_PN=JPEG_TN".to_string(),
            size: None,
            bitrate: None,
            duration: None,
            resolution: None,
        });

        DidlObject::Item {
            id: entry.object.id(),
            parent_id: entry.object.parent_id(),
            title: entry.name.clone(),
            class,
            icon: Some(icon),
            artist: tag("artist"),
            album: tag("album"),
            genre: tag("genre"),
            resources,
        }
    }

    fn browse_args(result: String, returned: usize, total: usize, update_id: u32) -> OutArgs {
        vec![
            ("Result", result),
            ("NumberReturned", returned.to_string()),
            ("TotalMatches", total.to_string()),
            ("UpdateID", update_id.to_string()),
        ]
    }

    async fn browse(&self, args_xml: &str, ctx: &RequestContext) -> Result<OutArgs, UpnpError> {
        let request: BrowseRequest = quick_xml::de::from_str(args_xml)
            .map_err(|e| UpnpError::invalid_args(format!("undecodable Browse arguments: {e}")))?;
        let object = object::object_from_id(&request.object_id)
            .map_err(|e| UpnpError::no_such_object(e.to_string()))?;
        let folders_last = ctx.user_agent.contains(FOLDERS_LAST_UA);
        let update_id = self.core.system_update_id();

        match request.browse_flag.as_str() {
            "BrowseDirectChildren" => {
                let entries = self
                    .core
                    .model
                    .read_container(&object, folders_last)
                    .map_err(|e| UpnpError::no_such_object(e.to_string()))?;
                let total = entries.len();
                let start = request.starting_index.min(total);
                let end = match request.requested_count {
                    0 => total,
                    n => (start + n).min(total),
                };
                let mut rendered = String::new();
                for entry in &entries[start..end] {
                    rendered.push_str(&render_object(&self.entry_to_didl(entry, &ctx.host).await));
                }
                Ok(Self::browse_args(
                    didl_lite(&rendered),
                    end - start,
                    total,
                    update_id,
                ))
            }
            "BrowseMetadata" => {
                let entry = self
                    .core
                    .model
                    .entry(&object)
                    .map_err(|e| UpnpError::no_such_object(e.to_string()))?
                    .ok_or_else(|| UpnpError::no_such_object(format!("{} is filtered", object.path)))?;
                let rendered = render_object(&self.entry_to_didl(&entry, &ctx.host).await);
                Ok(Self::browse_args(didl_lite(&rendered), 1, 1, update_id))
            }
            other => Err(UpnpError::invalid_args(format!(
                "unhandled browse flag: {other}"
            ))),
        }
    }
}

/// A sibling `.srt` file's virtual path, when one exists on disk.
fn subtitle_sibling(fs_path: &Path, virtual_path: &str) -> Option<String> {
    if !fs_path.with_extension("srt").is_file() {
        return None;
    }
    let stem = virtual_path
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(virtual_path);
    Some(format!("{stem}.srt"))
}

/// Hard-coded Samsung feature list; the A/V/I containers all live under
/// the root here.
const FEATURE_LIST: &str = concat!(
    r#"<Features xmlns="urn:schemas-upnp-org:av:avs""#,
    r#" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance""#,
    r#" xsi:schemaLocation="urn:schemas-upnp-org:av:avs http://www.upnp.org/schemas/av/avs.xsd">"#,
    r#"<Feature name="samsung.com.ARTIST" version="1">"#,
    r#"<objectIds>0</objectIds>"#,
    r#"</Feature>"#,
    r#"</Features>"#
);

#[async_trait]
impl UpnpService for ContentDirectoryService {
    async fn handle(
        &self,
        action: &str,
        args_xml: &str,
        ctx: &RequestContext,
    ) -> Result<OutArgs, UpnpError> {
        match action {
            "Browse" => self.browse(args_xml, ctx).await,
            "GetSystemUpdateID" => Ok(vec![("Id", self.core.system_update_id().to_string())]),
            "GetSortCapabilities" => Ok(vec![("SortCaps", "dc:title".to_string())]),
            "GetSearchCapabilities" => Ok(vec![("SearchCaps", String::new())]),
            "X_GetFeatureList" => Ok(vec![("FeatureList", FEATURE_LIST.to_string())]),
            "X_SetBookmark" => Ok(vec![]),
            other => {
                debug!("unhandled ContentDirectory action {other:?}");
                Err(UpnpError::invalid_action())
            }
        }
    }
}

/// Microsoft interop: every renderer is authorised and validated.
#[derive(Default)]
pub struct MediaReceiverRegistrarService;

#[async_trait]
impl UpnpService for MediaReceiverRegistrarService {
    async fn handle(
        &self,
        action: &str,
        _args_xml: &str,
        _ctx: &RequestContext,
    ) -> Result<OutArgs, UpnpError> {
        match action {
            "IsAuthorized" | "IsValidated" => Ok(vec![("Result", "1".to_string())]),
            "RegisterDevice" => Ok(vec![]),
            _ => Err(UpnpError::invalid_action()),
        }
    }
}

#[derive(Default)]
pub struct ConnectionManagerService;

#[async_trait]
impl UpnpService for ConnectionManagerService {
    async fn handle(
        &self,
        action: &str,
        _args_xml: &str,
        _ctx: &RequestContext,
    ) -> Result<OutArgs, UpnpError> {
        match action {
            "GetProtocolInfo" => Ok(vec![
                ("Source", "http-get:*:*:*".to_string()),
                ("Sink", String::new()),
            ]),
            "GetCurrentConnectionIDs" => Ok(vec![("ConnectionIDs", "0".to_string())]),
            "GetCurrentConnectionInfo" => Ok(vec![
                ("RcsID", "-1".to_string()),
                ("AVTransportID", "-1".to_string()),
                ("ProtocolInfo", String::new()),
                ("PeerConnectionManager", String::new()),
                ("PeerConnectionID", "-1".to_string()),
                ("Direction", "Output".to_string()),
                ("Status", "OK".to_string()),
            ]),
            _ => Err(UpnpError::invalid_action()),
        }
    }
}
