//! Static client-side assets served verbatim. These are the opaque tracking
//! libraries a page embeds to call `/collect`; the gateway never inspects
//! or transforms their content, only serves them with the right content
//! type.

pub const PIXEL_JS: &str = include_str!("pixel.js");
pub const PIXEL_UMD_JS: &str = include_str!("pixel.umd.js");
pub const PIXEL_ESM_JS: &str = include_str!("pixel.esm.js");

/// A 1x1 transparent GIF, served by `/px.gif` for environments that block
/// `fetch`/`XMLHttpRequest` tracking but allow image loads.
pub const TRANSPARENT_PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00,
    0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02,
    0x02, 0x44, 0x01, 0x00, 0x3b,
];
