//! The texture plug: the one handle meaning "no texture yet".

use std::sync::OnceLock;

use super::renderer::RenderHandle;

static TEXTURE_PLUG: OnceLock<RenderHandle> = OnceLock::new();

/// Process-wide placeholder handle.
///
/// Allocated on first use and never changed afterwards, so it can be copied
/// around and compared without any locking.
pub fn texture_plug() -> RenderHandle {
    *TEXTURE_PLUG.get_or_init(|| {
        log::debug!("Created texture plug");
        RenderHandle::placeholder()
    })
}
