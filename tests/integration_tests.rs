//! End-to-end tests: a real listener on loopback, real HTTP traffic.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dlnacast::cds::{
    ConnectionManagerService, ContentDirectoryService, MediaReceiverRegistrarService,
};
use dlnacast::config::Config;
use dlnacast::dlna;
use dlnacast::server::ServerCore;
use dlnacast::soap::ServiceRegistry;
use dlnacast::ssdp;
use dlnacast::state::AppState;
use dlnacast::web;

const CDS_URN: &str = "urn:schemas-upnp-org:service:ContentDirectory:1";

fn write_avi(path: &Path) {
    std::fs::write(path, b"RIFF\x00\x00\x00\x00AVI LIST0123456789abcdef").unwrap();
}

fn base_config(root: &Path) -> Config {
    Config {
        path: root.to_path_buf(),
        ffprobe_cache_path: None,
        no_probe: true,
        ..Default::default()
    }
}

async fn spawn_server(config: Config) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let core = Arc::new(ServerCore::new(config, addr.port()).unwrap());
    let mut registry = ServiceRegistry::new();
    registry.register(
        "ContentDirectory",
        Arc::new(ContentDirectoryService::new(core.clone())),
    );
    registry.register(
        "ConnectionManager",
        Arc::new(ConnectionManagerService::default()),
    );
    registry.register(
        "X_MS_MediaReceiverRegistrar",
        Arc::new(MediaReceiverRegistrarService::default()),
    );
    let state = AppState {
        core: core.clone(),
        services: Arc::new(registry),
        root_desc: Arc::new(web::xml::generate_device_description(
            &core.friendly_name,
            &core.udn,
        )),
    };
    let app = web::create_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn browse_envelope(object_id: &str, flag: &str, start: usize, count: usize) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="utf-8"?>"#,
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">"#,
            "<s:Body>",
            r#"<u:Browse xmlns:u="{urn}">"#,
            "<ObjectID>{id}</ObjectID>",
            "<BrowseFlag>{flag}</BrowseFlag>",
            "<Filter>*</Filter>",
            "<StartingIndex>{start}</StartingIndex>",
            "<RequestedCount>{count}</RequestedCount>",
            "<SortCriteria></SortCriteria>",
            "</u:Browse>",
            "</s:Body></s:Envelope>"
        ),
        urn = CDS_URN,
        id = object_id,
        flag = flag,
        start = start,
        count = count,
    )
}

async fn soap_browse(
    addr: SocketAddr,
    object_id: &str,
    flag: &str,
    start: usize,
    count: usize,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/ctl"))
        .header("SOAPACTION", format!("\"{CDS_URN}#Browse\""))
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .body(browse_envelope(object_id, flag, start, count))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn device_description_is_served() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(base_config(dir.path())).await;

    let resp = reqwest::get(format!("http://{addr}/rootDesc.xml"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("server")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("DLNADOC/1.50"));
    assert!(resp.headers().contains_key("ext"));
    let body = resp.text().await.unwrap();
    assert!(body.contains("urn:schemas-upnp-org:device:MediaServer:1"));
    assert!(body.contains("<UDN>uuid:"));

    for key in ["ContentDirectory", "ConnectionManager", "X_MS_MediaReceiverRegistrar"] {
        let resp = reqwest::get(format!("http://{addr}/scpd/{key}")).await.unwrap();
        assert_eq!(resp.status(), 200, "scpd for {key}");
    }
    let resp = reqwest::get(format!("http://{addr}/scpd/Nope")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn root_browse_lists_container_and_item() {
    let dir = tempfile::tempdir().unwrap();
    write_avi(&dir.path().join("movie.mkv"));
    std::fs::create_dir(dir.path().join("photos")).unwrap();
    std::fs::write(dir.path().join("photos/pic.png"), b"\x89PNG\r\n\x1a\n").unwrap();
    let addr = spawn_server(base_config(dir.path())).await;

    let resp = soap_browse(addr, "0", "BrowseDirectChildren", 0, 0).await;
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("<u:BrowseResponse"));
    assert!(body.contains("<TotalMatches>2</TotalMatches>"));
    assert!(body.contains("<NumberReturned>2</NumberReturned>"));
    // The DIDL payload travels XML-escaped inside Result.
    assert!(body.contains("&lt;DIDL-Lite"));
    let unescaped = body
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");
    let container = unescaped.find("<container").unwrap();
    let item = unescaped.find("<item").unwrap();
    assert!(container < item, "folders first");
    assert!(unescaped.contains("<dc:title>photos</dc:title>"));
    assert!(unescaped.contains("<dc:title>movie.mkv</dc:title>"));
}

#[tokio::test]
async fn pagination_boundary() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..5 {
        write_avi(&dir.path().join(format!("clip{i}.avi")));
    }
    let addr = spawn_server(base_config(dir.path())).await;

    let resp = soap_browse(addr, "0", "BrowseDirectChildren", 3, 5).await;
    let body = resp.text().await.unwrap();
    assert!(body.contains("<TotalMatches>5</TotalMatches>"));
    assert!(body.contains("<NumberReturned>2</NumberReturned>"));
}

#[tokio::test]
async fn malicious_object_id_faults_with_701() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(base_config(dir.path())).await;

    let resp = soap_browse(addr, "/../../etc/passwd", "BrowseDirectChildren", 0, 0).await;
    assert_eq!(resp.status(), 500);
    let body = resp.text().await.unwrap();
    assert!(body.contains("<s:Fault>"));
    assert!(body.contains("<errorCode>701</errorCode>"));
}

#[tokio::test]
async fn bad_soap_requests_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(base_config(dir.path())).await;
    let client = reqwest::Client::new();

    // Unquoted SOAPACTION.
    let resp = client
        .post(format!("http://{addr}/ctl"))
        .header("SOAPACTION", format!("{CDS_URN}#Browse"))
        .body(browse_envelope("0", "BrowseDirectChildren", 0, 0))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Missing header entirely.
    let resp = client
        .post(format!("http://{addr}/ctl"))
        .body(browse_envelope("0", "BrowseDirectChildren", 0, 0))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown browse flag becomes a 600-class fault.
    let resp = soap_browse(addr, "0", "BrowseSideways", 0, 0).await;
    assert_eq!(resp.status(), 500);
    let body = resp.text().await.unwrap();
    assert!(body.contains("<errorCode>600</errorCode>"));
}

#[tokio::test]
async fn media_receiver_registrar_always_authorises() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(base_config(dir.path())).await;

    let urn = "urn:microsoft.com:service:X_MS_MediaReceiverRegistrar:1";
    let body = format!(
        concat!(
            r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">"#,
            r#"<s:Body><u:IsAuthorized xmlns:u="{urn}"><DeviceID/></u:IsAuthorized></s:Body>"#,
            "</s:Envelope>"
        ),
        urn = urn
    );
    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/ctl"))
        .header("SOAPACTION", format!("\"{urn}#IsAuthorized\""))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("<Result>1</Result>"));
}

#[tokio::test]
async fn resource_serving_with_ranges() {
    let dir = tempfile::tempdir().unwrap();
    write_avi(&dir.path().join("movie.avi"));
    let addr = spawn_server(base_config(dir.path())).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/res?path=/movie.avi");

    // Whole file.
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["accept-ranges"], "bytes");
    assert_eq!(resp.headers()["content-type"], "video/avi");
    let full = resp.bytes().await.unwrap();
    assert_eq!(full.len(), 32);

    // A middle slice.
    let resp = client.get(&url).header("Range", "bytes=4-7").send().await.unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"], "bytes 4-7/32");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &full[4..8]);

    // Suffix slice.
    let resp = client.get(&url).header("Range", "bytes=-4").send().await.unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &full[28..]);

    // Unsatisfiable.
    let resp = client.get(&url).header("Range", "bytes=99-").send().await.unwrap();
    assert_eq!(resp.status(), 416);
}

#[tokio::test]
async fn resource_paths_stay_under_root() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(base_config(dir.path())).await;

    // Traversal attempts resolve inside the (empty) root and miss.
    let resp = reqwest::get(format!("http://{addr}/res?path=../../etc/passwd"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let resp = reqwest::get(format!("http://{addr}/res?path=%2F..%2F..%2Fetc%2Fpasswd"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn transcode_requires_known_profile() {
    let dir = tempfile::tempdir().unwrap();
    write_avi(&dir.path().join("movie.avi"));

    // Unknown profile key is a 404.
    let addr = spawn_server(base_config(dir.path())).await;
    let resp = reqwest::get(format!("http://{addr}/res?path=/movie.avi&transcode=divx"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Transcoding disabled entirely is a 404 even for known profiles.
    let mut config = base_config(dir.path());
    config.no_transcode = true;
    let addr = spawn_server(config).await;
    let resp = reqwest::get(format!("http://{addr}/res?path=/movie.avi&transcode=t"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn subtitles_are_plain_text() {
    let dir = tempfile::tempdir().unwrap();
    write_avi(&dir.path().join("movie.avi"));
    std::fs::write(dir.path().join("movie.srt"), "1\n00:00:01,000 --> 00:00:02,000\nhi\n")
        .unwrap();
    let addr = spawn_server(base_config(dir.path())).await;

    let resp = reqwest::get(format!("http://{addr}/subtitle?path=/movie.srt"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    assert!(resp.text().await.unwrap().contains("00:00:01,000"));

    // Only subtitle files come out of this endpoint.
    let resp = reqwest::get(format!("http://{addr}/subtitle?path=/movie.avi"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn eventing_subscription_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_server(base_config(dir.path())).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/evt/ContentDirectory");
    let subscribe = reqwest::Method::from_bytes(b"SUBSCRIBE").unwrap();
    let unsubscribe = reqwest::Method::from_bytes(b"UNSUBSCRIBE").unwrap();

    let resp = client
        .request(subscribe.clone(), &url)
        .header("CALLBACK", "<http://127.0.0.1:1/evt>")
        .header("NT", "upnp:event")
        .header("TIMEOUT", "Second-300")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let sid = resp.headers()["sid"].to_str().unwrap().to_string();
    assert!(sid.starts_with("uuid:"));
    assert_eq!(resp.headers()["timeout"], "Second-300");

    // Renewal by SID.
    let resp = client
        .request(subscribe.clone(), &url)
        .header("SID", &sid)
        .header("TIMEOUT", "Second-600")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["timeout"], "Second-600");

    let resp = client
        .request(unsubscribe.clone(), &url)
        .header("SID", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Gone now.
    let resp = client
        .request(unsubscribe, &url)
        .header("SID", &sid)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 412);

    // Unknown services are not evented.
    let resp = client
        .request(subscribe, format!("http://{addr}/evt/Bogus"))
        .header("CALLBACK", "<http://127.0.0.1:1/evt>")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 501);
}

#[tokio::test]
async fn blacklisted_clients_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.blacklisted_ip_nets = vec!["127.0.0.0/8".to_string()];
    let addr = spawn_server(config).await;

    let resp = reqwest::get(format!("http://{addr}/rootDesc.xml"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[test]
fn npt_round_trip_with_precision_bump() {
    let parsed = dlna::parse_npt_duration("0:22:57.628").unwrap();
    let bumped = parsed + Duration::from_millis(1);
    assert_eq!(dlna::format_npt(bumped), "00:22:57.629");
    assert_eq!(dlna::parse_npt_duration(&dlna::format_npt(bumped)).unwrap(), bumped);
}

#[test]
fn msearch_from_subnet_yields_all_targets() {
    // Message-level rendition of the discovery scenario: the canonical
    // ssdp:all search matched against the advertised target set.
    let packet = b"M-SEARCH * HTTP/1.1\r\nHOST:239.255.255.250:1900\r\nMAN:\"ssdp:discover\"\r\nMX:2\r\nST:ssdp:all\r\n\r\n";
    let req = ssdp::parse_msearch(packet).unwrap();
    assert_eq!(req.man, "\"ssdp:discover\"");
    assert_eq!(req.host, ssdp::Scope::V4.host_string());
    assert_eq!(ssdp::clamp_mx(req.mx), 2);

    let addrs = [ssdp::IfaceAddr {
        ip: "192.168.1.10".parse().unwrap(),
        prefix: 24,
    }];
    let source = ssdp::source_ip_for(&addrs, "192.168.1.77".parse().unwrap());
    assert_eq!(source, Some("192.168.1.10".parse().unwrap()));
    // A sender outside every subnet gets no response at all.
    assert_eq!(
        ssdp::source_ip_for(&addrs, "172.16.0.9".parse().unwrap()),
        None
    );
}
