//! The renderer seam: the backend trait hiding the renderer library, the
//! software backend, and the process-wide state façade serializing access to
//! whichever backend is installed.

pub mod backend;
pub mod headless;
pub mod state;
