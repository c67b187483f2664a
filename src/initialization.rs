use wgpu::{Adapter, Device, DeviceDescriptor, Features, Queue, RequestDeviceError};

/// Creates a wgpu [`Device`] and [`Queue`] with the features the pipeline can make use of.
///
/// If the adapter does not support a given feature, it will set the corresponding variable in `feature_support` to false.
pub fn request_device(
    adapter: &Adapter,
    device_descriptor: &DeviceDescriptor,
    feature_support: &mut FeatureSupport,
) -> Result<(Device, Queue), InitializationError> {
    let mut descriptor = device_descriptor.clone();
    if adapter.features().contains(Features::TIMESTAMP_QUERY) {
        descriptor.required_features |= Features::TIMESTAMP_QUERY;
    } else {
        tracing::warn!("adapter lacks timestamp queries, dynamic radius adjustment unavailable");
        feature_support.timestamp_queries_supported = false;
    }
    if adapter
        .features()
        .contains(Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES)
    {
        descriptor.required_features |= Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;
    } else {
        tracing::info!("adapter lacks format-specific features, 10-bit reconstruction falls back to a wider format");
        feature_support.adapter_format_features_supported = false;
    }

    Ok(pollster::block_on(adapter.request_device(&descriptor))?)
}

/// Which optional pipeline features are supported on the current system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSupport {
    /// GPU timestamps for frame-time driven adaptation are supported.
    pub timestamp_queries_supported: bool,
    /// The adapter's own format capabilities are enabled, so a 10-bit reconstruction target can
    /// be used where the adapter allows it. See [`crate::WgpuDeviceContext::with_adapter_format_features`].
    pub adapter_format_features_supported: bool,
}

impl Default for FeatureSupport {
    fn default() -> Self {
        Self {
            timestamp_queries_supported: true,
            adapter_format_features_supported: true,
        }
    }
}

/// Error returned by [`request_device`].
#[derive(thiserror::Error, Debug)]
pub enum InitializationError {
    #[error(transparent)]
    RequestDeviceError(#[from] RequestDeviceError),
}
