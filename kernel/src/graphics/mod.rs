//! Graphics dispatch
//!
//! The graphics "driver" is a selector over candidate back-ends. Loading
//! scores every candidate by the capabilities it reports and orders them
//! descending; every subsequent call goes to the active backend and
//! falls through to the next one in order when the backend answers
//! "not implemented" or fails unexpectedly. Drawing internals live in
//! the back-ends; only the command contract is fixed here.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::drivers::{
    DriverCommand, DriverDescriptor, DriverFunction, DriverKind, DriverResult, DriverValue, Param,
};
use crate::error::KernelError;

const VER_MAJOR: u32 = 1;
const VER_MINOR: u32 = 0;

/// Capabilities a backend reports when asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GfxCapabilities {
    pub has_hardware_modeset: bool,
    pub has_page_flip: bool,
    pub has_vblank_interrupt: bool,
    pub has_cursor_plane: bool,
    pub supports_tiled_surface: bool,
    pub max_width: u32,
    pub max_height: u32,
}

/// One display mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GfxModeInfo {
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub pitch: u32,
    pub framebuffer: u32,
}

/// One drawable surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GfxSurface {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bits_per_pixel: u32,
    pub base: u32,
}

/// Text-mode requests forwarded to backends that drive a text console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextRequest {
    PutCell {
        column: u32,
        row: u32,
        glyph: u8,
        attribute: u8,
    },
    ClearRegion {
        column: u32,
        row: u32,
        width: u32,
        height: u32,
    },
    ScrollRegion {
        column: u32,
        row: u32,
        width: u32,
        height: u32,
        lines: i32,
    },
    SetCursor {
        column: u32,
        row: u32,
    },
    SetCursorVisible(bool),
}

struct Backend {
    driver: Arc<dyn DriverCommand>,
    score: u32,
}

struct SelectorState {
    backends: Vec<Backend>,
    active: usize,
}

/// The graphics selector driver.
pub struct GraphicsSelector {
    descriptor: DriverDescriptor,
    state: Mutex<SelectorState>,
}

static SELECTOR: Once<Arc<GraphicsSelector>> = Once::new();

pub fn selector() -> Arc<GraphicsSelector> {
    SELECTOR
        .call_once(|| {
            Arc::new(GraphicsSelector {
                descriptor: DriverDescriptor::new(
                    DriverKind::Graphics,
                    VER_MAJOR,
                    VER_MINOR,
                    "EXOS",
                    "EXOS",
                    "Graphics selector",
                    &[],
                ),
                state: Mutex::new(SelectorState {
                    backends: Vec::new(),
                    active: 0,
                }),
            })
        })
        .clone()
}

/// Score a candidate by its reported capabilities. Backends that are
/// not ready score zero and are dropped; backends that cannot answer
/// the capability query still score one so a bare framebuffer stays
/// usable as a last resort.
fn score_backend(driver: &Arc<dyn DriverCommand>) -> u32 {
    if !driver.descriptor().is_ready() {
        return 0;
    }

    let mut capabilities = GfxCapabilities::default();
    if driver
        .command(
            DriverFunction::GfxGetCapabilities,
            &mut Param::GfxCapabilities(&mut capabilities),
        )
        .is_err()
    {
        return 1;
    }

    let mut score = 10;
    if capabilities.has_hardware_modeset {
        score += 10;
    }
    if capabilities.has_page_flip {
        score += 5;
    }
    if capabilities.has_vblank_interrupt {
        score += 3;
    }
    if capabilities.has_cursor_plane {
        score += 2;
    }
    if capabilities.supports_tiled_surface {
        score += 2;
    }
    if capabilities.max_width >= 1920 && capabilities.max_height >= 1080 {
        score += 1;
    }
    score
}

impl GraphicsSelector {
    /// Load and score every candidate, keeping them ordered by score
    /// descending. The best backend becomes active.
    pub fn load_backends(&self, candidates: Vec<Arc<dyn DriverCommand>>) {
        let mut state = self.state.lock();
        state.backends.clear();
        state.active = 0;

        for candidate in candidates {
            if candidate
                .command(DriverFunction::Load, &mut Param::None)
                .is_ok()
            {
                candidate.descriptor().mark_ready();
            }
            let score = score_backend(&candidate);
            if score == 0 {
                log::debug!(
                    "gfx: backend '{}' not ready, skipped",
                    candidate.descriptor().product
                );
                continue;
            }

            let position = state
                .backends
                .iter()
                .position(|backend| backend.score < score)
                .unwrap_or(state.backends.len());
            state.backends.insert(
                position,
                Backend {
                    driver: candidate,
                    score,
                },
            );
        }

        for backend in &state.backends {
            log::info!(
                "gfx: backend '{}' scored {}",
                backend.driver.descriptor().product,
                backend.score
            );
        }
    }

    pub fn backend_count(&self) -> usize {
        self.state.lock().backends.len()
    }

    pub fn active_backend(&self) -> Option<Arc<dyn DriverCommand>> {
        let state = self.state.lock();
        state
            .backends
            .get(state.active)
            .map(|backend| backend.driver.clone())
    }

    /// Forward a call starting at the active backend, falling through on
    /// "not implemented" or unexpected failure.
    fn forward(&self, function: DriverFunction, param: &mut Param<'_>) -> DriverResult {
        let (ordered, active) = {
            let state = self.state.lock();
            (
                state
                    .backends
                    .iter()
                    .map(|backend| backend.driver.clone())
                    .collect::<Vec<_>>(),
                state.active,
            )
        };
        if ordered.is_empty() {
            return Err(KernelError::NoDevice);
        }

        let mut last = Err(KernelError::NotImplemented);
        for offset in 0..ordered.len() {
            let index = (active + offset) % ordered.len();
            match ordered[index].command(function, param) {
                Ok(value) => return Ok(value),
                Err(KernelError::NotImplemented) | Err(KernelError::Generic) => {
                    last = Err(KernelError::NotImplemented);
                }
                Err(err) => return Err(err),
            }
        }
        last
    }
}

impl DriverCommand for GraphicsSelector {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn command(&self, function: DriverFunction, param: &mut Param<'_>) -> DriverResult {
        match function {
            DriverFunction::Load | DriverFunction::Unload => Ok(DriverValue::None),
            DriverFunction::GetVersion => Ok(self.descriptor.version_value()),
            _ => self.forward(function, param),
        }
    }
}

#[doc(hidden)]
pub fn reset_for_tests() {
    if let Some(selector) = SELECTOR.get() {
        let mut state = selector.state.lock();
        state.backends.clear();
        state.active = 0;
    }
}
