//! In-memory collaborators for layer tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use foundation::GeoBoundingBox;
use formats::{Dtype, VolumeData, VolumeHeader, encode_volume_pack};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use streaming::{CameraPose, FetchError, VolumeBackend, VolumeQuery};
use tokio::sync::oneshot;

use crate::host::RenderHost;

pub const SAMPLE_VALUES: [u8; 8] = [0, 64, 128, 192, 255, 32, 96, 160];

pub fn equator_box() -> GeoBoundingBox {
    GeoBoundingBox::new(-0.5, -0.5, 0.5, 0.5, 0.0, 12_000.0).unwrap()
}

/// A 2x2x2 uint8 pack scaled into [0, 1].
pub fn sample_pack(bbox: Option<GeoBoundingBox>) -> Vec<u8> {
    let mut header = VolumeHeader::new([2, 2, 2], Dtype::Uint8);
    header.scale = 1.0 / 255.0;
    header.bbox = bbox;
    header.variable = Some("cloud_fraction".to_string());
    encode_volume_pack(&header, &VolumeData::Uint8(SAMPLE_VALUES.to_vec())).unwrap()
}

type Reply = Result<Bytes, FetchError>;

async fn panicking_fetch() -> Reply {
    panic!("mock backend panicked")
}

#[derive(Default)]
struct MockState {
    queries: Vec<VolumeQuery>,
    hold: bool,
    panic: bool,
    failure: Option<FetchError>,
    body: Option<Bytes>,
    pending: Vec<(VolumeQuery, oneshot::Sender<Reply>)>,
}

/// Backend answering with [`sample_pack`] for the requested box.
///
/// With [`MockBackend::hold_responses`] each fetch parks until the test
/// releases it, which lets tests interleave camera updates with in-flight
/// requests.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold_responses(&self) {
        self.state.lock().hold = true;
    }

    /// Every fetch future panics when polled.
    pub fn panic_on_fetch(&self) {
        self.state.lock().panic = true;
    }

    pub fn fail_with(&self, err: FetchError) {
        self.state.lock().failure = Some(err);
    }

    /// Serve this body instead of a generated pack.
    pub fn respond_with(&self, body: Vec<u8>) {
        self.state.lock().body = Some(Bytes::from(body));
    }

    pub fn queries(&self) -> Vec<VolumeQuery> {
        self.state.lock().queries.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state.lock().queries.len()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Complete the oldest parked fetch. Returns false if none was parked.
    pub fn release_next(&self) -> bool {
        let next = {
            let mut st = self.state.lock();
            if st.pending.is_empty() {
                None
            } else {
                let body = st.body.clone();
                Some((st.pending.remove(0), body))
            }
        };
        match next {
            Some(((query, tx), body)) => {
                let body = body.unwrap_or_else(|| Bytes::from(sample_pack(Some(query.bbox))));
                let _ = tx.send(Ok(body));
                true
            }
            None => false,
        }
    }
}

impl VolumeBackend for MockBackend {
    fn fetch(&self, query: &VolumeQuery) -> BoxFuture<'static, Result<Bytes, FetchError>> {
        let mut st = self.state.lock();
        st.queries.push(query.clone());

        if st.panic {
            return Box::pin(panicking_fetch());
        }
        if let Some(err) = st.failure.clone() {
            return Box::pin(async move { Err(err) });
        }
        if st.hold {
            let (tx, rx) = oneshot::channel();
            st.pending.push((query.clone(), tx));
            return Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(FetchError::Transport("mock dropped".to_string())))
            });
        }
        let body = st
            .body
            .clone()
            .unwrap_or_else(|| Bytes::from(sample_pack(Some(query.bbox))));
        Box::pin(async move { Ok(body) })
    }
}

/// Host that counts redraw requests and serves a settable camera.
pub struct RecordingHost {
    redraws: AtomicUsize,
    pose: Mutex<CameraPose>,
}

impl RecordingHost {
    pub fn new(pose: CameraPose) -> Self {
        Self {
            redraws: AtomicUsize::new(0),
            pose: Mutex::new(pose),
        }
    }

    pub fn redraws(&self) -> usize {
        self.redraws.load(Ordering::SeqCst)
    }

    pub fn set_pose(&self, pose: CameraPose) {
        *self.pose.lock() = pose;
    }
}

impl RenderHost for RecordingHost {
    fn request_redraw(&self) {
        self.redraws.fetch_add(1, Ordering::SeqCst);
    }

    fn camera_pose(&self) -> CameraPose {
        *self.pose.lock()
    }
}
