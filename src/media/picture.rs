//! Packed YUV420p plane shuffling.
//!
//! Decoded pictures travel through the pipeline as one contiguous
//! Y+U+V buffer with stride padding stripped, so units can be sliced
//! and shared without carrying library frame handles around. These
//! helpers convert between that packed form and strided frames at the
//! media-library boundary.

use ac_ffmpeg::codec::video::{VideoFrame, VideoFrameMut};

/// Bytes needed for a packed YUV420p picture.
pub fn packed_size(width: usize, height: usize) -> usize {
    let chroma = (width / 2) * (height / 2);
    width * height + chroma * 2
}

/// Flatten a decoded frame into `dst`, stripping stride padding.
/// Returns false when the frame does not carry three planes.
pub fn pack_into(dst: &mut Vec<u8>, frame: &VideoFrame) -> bool {
    let width = frame.width();
    let height = frame.height();
    let planes = frame.planes();
    if planes.len() < 3 {
        return false;
    }

    dst.resize(packed_size(width, height), 0);
    let (cw, ch) = (width / 2, height / 2);
    let y_size = width * height;
    let c_size = cw * ch;

    extract_plane(&mut dst[..y_size], planes[0].data(), planes[0].line_size(), width, height);
    extract_plane(
        &mut dst[y_size..y_size + c_size],
        planes[1].data(),
        planes[1].line_size(),
        cw,
        ch,
    );
    extract_plane(
        &mut dst[y_size + c_size..],
        planes[2].data(),
        planes[2].line_size(),
        cw,
        ch,
    );
    true
}

/// Spread a packed picture back into a frame's strided planes.
pub fn fill_from_packed(frame: &mut VideoFrameMut, packed: &[u8], width: usize, height: usize) {
    let (cw, ch) = (width / 2, height / 2);
    let y_size = width * height;
    let c_size = cw * ch;
    if packed.len() < y_size + c_size * 2 {
        return;
    }

    let mut planes = frame.planes_mut();
    fill_plane(planes[0].data_mut(), &packed[..y_size], width, height);
    fill_plane(planes[1].data_mut(), &packed[y_size..y_size + c_size], cw, ch);
    fill_plane(planes[2].data_mut(), &packed[y_size + c_size..], cw, ch);
}

/// Copy a strided plane to a contiguous buffer.
fn extract_plane(dst: &mut [u8], src: &[u8], stride: usize, width: usize, height: usize) {
    // Fast path: no stride padding
    if stride == width && src.len() >= width * height {
        dst.copy_from_slice(&src[..width * height]);
        return;
    }
    for row in 0..height {
        let src_start = row * stride;
        let dst_start = row * width;
        if src_start + width > src.len() || dst_start + width > dst.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}

/// Copy a contiguous buffer into a strided plane. The stride is taken
/// from the plane's own allocation.
fn fill_plane(data: &mut [u8], src: &[u8], width: usize, height: usize) {
    if height == 0 {
        return;
    }
    let stride = data.len() / height;
    if stride == width && data.len() >= width * height {
        data[..width * height].copy_from_slice(&src[..width * height]);
        return;
    }
    for row in 0..height {
        let dst_start = row * stride;
        let src_start = row * width;
        if dst_start + width > data.len() || src_start + width > src.len() {
            break;
        }
        data[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}
