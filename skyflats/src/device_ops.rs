//! Device Capability Traits
//!
//! This module defines the interface to the devices the flat fielder drives.
//! The actual implementation is provided by the proxy layer of the owning
//! process (or by [`crate::simulation`] for tests).
//!
//! Every command is an `async fn`. A command future that has been created but
//! not awaited yet is the pending operation; several of them are awaited
//! together with [`wait_all`]. Timeouts are the responsibility of the
//! implementation, which reports them as
//! [`DeviceError::Timeout`](crate::error::DeviceError::Timeout).
//!
//! Optional camera features (binning, windowing) are separate capability
//! traits, queried with [`Camera::binning`] and [`Camera::window`] before use.

use crate::error::DeviceResult;
use crate::image::FrameData;
use crate::{HorizontalPosition, ImageType, PixelRect};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;

/// Reference to an image stored by the camera, resolved by an [`ImageStore`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =========================================================================
// TELESCOPE
// =========================================================================

#[async_trait]
pub trait Telescope: Send + Sync {
    /// Move to a horizontal position and return once it is reached
    async fn point(&self, position: HorizontalPosition) -> DeviceResult<()>;

    /// Stop any motion, including tracking
    async fn stop_motion(&self) -> DeviceResult<()>;
}

// =========================================================================
// FILTER WHEEL
// =========================================================================

#[async_trait]
pub trait FilterWheel: Send + Sync {
    /// Set filter by name and return once it is in the beam
    async fn set_filter(&self, name: &str) -> DeviceResult<()>;
}

// =========================================================================
// CAMERA
// =========================================================================

#[async_trait]
pub trait Camera: Send + Sync {
    /// Take an exposure and return a reference to the stored image.
    ///
    /// `broadcast` tells the camera whether other listeners should be
    /// notified about the new image (test frames are not broadcast).
    async fn expose(
        &self,
        exposure_time_ms: u64,
        image_type: ImageType,
        broadcast: bool,
    ) -> DeviceResult<ImageRef>;

    /// Request the camera to abort a running exposure
    async fn abort_exposure(&self) -> DeviceResult<()>;

    /// Binning capability, if the camera supports it
    fn binning(&self) -> Option<&dyn CameraBinning> {
        None
    }

    /// Windowing capability, if the camera supports it
    fn window(&self) -> Option<&dyn CameraWindow> {
        None
    }
}

#[async_trait]
pub trait CameraBinning: Send + Sync {
    async fn set_binning(&self, x: u32, y: u32) -> DeviceResult<()>;
}

#[async_trait]
pub trait CameraWindow: Send + Sync {
    /// Full usable frame of the detector at the current binning
    async fn full_frame(&self) -> DeviceResult<PixelRect>;

    async fn set_window(&self, window: PixelRect) -> DeviceResult<()>;
}

// =========================================================================
// IMAGE STORE
// =========================================================================

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Resolve an image reference to pixel data
    async fn download(&self, image: &ImageRef) -> DeviceResult<FrameData>;
}

/// Await two independent pending operations concurrently.
///
/// Both are driven to completion even if one fails early, so no device is
/// left half-commanded. The first error (in argument order) is returned.
pub async fn wait_all<A, B>(first: A, second: B) -> DeviceResult<()>
where
    A: Future<Output = DeviceResult<()>>,
    B: Future<Output = DeviceResult<()>>,
{
    let (a, b) = futures::future::join(first, second).await;
    a.and(b)
}
