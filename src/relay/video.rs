use log::info;

use std::sync::Arc;

use httparse::{Request, EMPTY_HEADER};

use crate::aspect::AspectRatio;
use crate::channels::channel_token;
use crate::service::ProxyService;

use super::Relay;

/*
    MPEG-2 sequence header layout for reference: http://dvdnav.mplayerhq.hu/dvdinfo/mpeghdrs.html

    00 00 01 B3 | width (12 bits) | height (12 bits) | aspect (4 bits) | frame rate (4 bits)

    The tuner only emits 704 or 720 wide, 480 tall streams, so the bytes
    between the start code and the aspect nibble are matched literally.
*/

/// Finds sequence headers in a byte stream and overwrites their aspect ratio
/// nibble. Survives the header being split across any number of chunks.
#[derive(Debug, Clone)]
pub struct AspectPatcher {
    code: u8,
    state: u8,
}

impl AspectPatcher {
    pub fn new(ratio: AspectRatio) -> Self {
        AspectPatcher {
            code: ratio.code(),
            state: 0,
        }
    }

    pub fn patch(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.state = match (self.state, *byte) {
                (0, 0x00) => 1,
                (0, _) => 0,
                (1, 0x00) => 2,
                (2, 0x01) => 3,
                (3, 0xB3) => 4,
                // 720 or 704 pixels wide
                (4, b) if b & 0xFE == 0x2C => 5,
                (5, 0x01) => 6,
                (6, 0xE0) => 7,
                (7, b) => {
                    if b & 0xEF == 0x24 {
                        *byte = (b & 0x0F) | (self.code << 4);
                    }
                    0
                }
                _ => 0,
            };
        }
    }
}

/// Relay for the tuner's capture port, patching the video of overridden channels.
pub struct VideoRelay {
    service: Arc<ProxyService>,
    channel: Option<String>,
    patcher: Option<AspectPatcher>,
}

impl VideoRelay {
    pub fn new(service: Arc<ProxyService>) -> Self {
        VideoRelay {
            service,
            channel: None,
            patcher: None,
        }
    }

    fn channel_name(&self) -> &str {
        self.channel.as_deref().unwrap_or("(unknown)")
    }
}

impl Relay for VideoRelay {
    fn kind(&self) -> &'static str {
        "video"
    }

    fn device_endpoint(&self) -> (String, u16) {
        let settings = self.service.settings();
        (settings.device_host_name.clone(), settings.device_capture_port)
    }

    fn inspect_request(&mut self, request: &mut Vec<u8>) {
        if self.channel.is_some() {
            return;
        }

        let Some(channel) = requested_channel(request) else {
            return;
        };

        let ratio = self.service.channels().get(&channel);

        if ratio.is_default() {
            info!(target: "hdhrproxy", "Streaming channel {} with default aspect ratio.", channel);
        } else {
            info!(target: "hdhrproxy", "Streaming channel {} with overridden aspect ratio of {}.", channel, ratio);
            self.patcher = Some(AspectPatcher::new(ratio));
        }

        self.channel = Some(channel);
    }

    fn inspect_response(&mut self, response: &mut Vec<u8>) {
        if let Some(patcher) = self.patcher.as_mut() {
            patcher.patch(response);
        }
    }

    fn on_client_disconnected(&self) {
        info!(target: "hdhrproxy", "Connection to channel {} was disconnected at the client.", self.channel_name());
    }

    fn on_lost_device_connection(&self) {
        info!(target: "hdhrproxy", "Connection to channel {} on the capture device was lost.", self.channel_name());
    }
}

/// Channel of a `GET /…/vMAJOR.MINOR` capture request.
fn requested_channel(request: &[u8]) -> Option<String> {
    let mut headers = [EMPTY_HEADER; 64];
    let mut req = Request::new(&mut headers);

    // A truncated or odd request still yields the request line.
    let _ = req.parse(request);

    if req.method != Some("GET") {
        return None;
    }

    let path = req.path?;

    path.rmatch_indices('/')
        .find_map(|(slash, _)| channel_token(&path[slash + 1..]))
        .map(String::from)
}
