//! about 命令

use crate::firmware::FIRMWARE_URL;
use fcp_firmware::SYSTEM_FIRMWARE_DIR;

const GITHUB_URL: &str = "https://github.com/geoffreybennett";

/// about 文本
pub fn about_text() -> String {
    format!(
        "FCP Tool Version {version}

ABOUT
-----

The FCP Tool provides firmware management for Focusrite(R) USB audio
interfaces using the Linux FCP driver.

REQUIREMENTS
------------

Requires the FCP USB protocol driver from
  {GITHUB_URL}/linux-fcp

Requires device firmware to be placed in:
  {SYSTEM_FIRMWARE_DIR}

Obtain firmware from:
  {FIRMWARE_URL}

Focusrite, Scarlett, Clarett, and Vocaster are trademarks or
registered trademarks of Focusrite Audio Engineering Limited in
England, USA, and/or other countries. Use of these trademarks does not
imply any affiliation or endorsement of this software.

SUPPORT AND ADDITIONAL SOFTWARE
-------------------------------

For support, please open an issue on GitHub:
  {GITHUB_URL}/fcp-support

GUI control panel available at:
  {GITHUB_URL}/alsa-scarlett-gui
",
        version = env!("CARGO_PKG_VERSION"),
    )
}

pub fn about() {
    print!("{}", about_text());
}
