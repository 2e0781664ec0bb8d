use std::sync::Arc;

use parking_lot::Mutex;

/// Transaction-private copy of one page.
pub(crate) struct Frame {
    pub data: Box<[u8]>,
    pub dirty: bool,
    pub freed: bool,
}

pub(crate) type FrameCell = Arc<Mutex<Frame>>;

impl Frame {
    /// Copy of a committed image; clean until written.
    pub fn copy_of(image: &[u8]) -> FrameCell {
        Arc::new(Mutex::new(Frame {
            data: image.to_vec().into_boxed_slice(),
            dirty: false,
            freed: false,
        }))
    }

    /// Zeroed image for a page that has never been written.
    pub fn zeroed(page_size: usize) -> FrameCell {
        Arc::new(Mutex::new(Frame {
            data: vec![0u8; page_size].into_boxed_slice(),
            dirty: true,
            freed: false,
        }))
    }
}
