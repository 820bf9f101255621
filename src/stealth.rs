//! Anti-detection script injected into every new tab before any navigation
//! (via `Page.addScriptToEvaluateOnNewDocument`).
//!
//! Hardware values are picked once per browser so every tab of one privacy
//! context reports the same machine.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

const WEBGL_PROFILES: &[(&str, &str)] = &[
    ("Intel Inc.", "Intel Iris OpenGL Engine"),
    ("Google Inc. (Intel)", "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0)"),
    ("Google Inc. (NVIDIA)", "ANGLE (NVIDIA, NVIDIA GeForce GTX 1660 Direct3D11 vs_5_0 ps_5_0)"),
];

/// Hardware the injected script claims to run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StealthProfile {
    pub hardware_concurrency: u32,
    pub device_memory: u32,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub timezone: Option<String>,
    pub locale: String,
}

impl Default for StealthProfile {
    fn default() -> Self {
        Self {
            hardware_concurrency: 8,
            device_memory: 8,
            webgl_vendor: WEBGL_PROFILES[0].0.to_string(),
            webgl_renderer: WEBGL_PROFILES[0].1.to_string(),
            timezone: None,
            locale: "en-US".to_string(),
        }
    }
}

impl StealthProfile {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let (vendor, renderer) = WEBGL_PROFILES
            .choose(&mut rng)
            .copied()
            .unwrap_or(WEBGL_PROFILES[0]);
        Self {
            hardware_concurrency: *[4, 6, 8, 12, 16].choose(&mut rng).unwrap_or(&8),
            device_memory: *[4, 8, 16].choose(&mut rng).unwrap_or(&8),
            webgl_vendor: vendor.to_string(),
            webgl_renderer: renderer.to_string(),
            ..Default::default()
        }
    }
}

/// Build the injection script for `profile`.
pub fn stealth_script(profile: &StealthProfile) -> String {
    format!(
        r#"
        Object.defineProperty(navigator, 'webdriver', {{ get: () => undefined }});
        Object.defineProperty(navigator, 'hardwareConcurrency', {{ get: () => {cores} }});
        Object.defineProperty(navigator, 'deviceMemory', {{ get: () => {memory} }});
        Object.defineProperty(navigator, 'languages', {{ get: () => ['{locale}', 'en'] }});

        if (!window.chrome) {{
            window.chrome = {{
                runtime: {{
                    connect: function() {{
                        return {{
                            onMessage: {{ addListener: function() {{}}, removeListener: function() {{}} }},
                            postMessage: function() {{}},
                            disconnect: function() {{}}
                        }};
                    }},
                    sendMessage: function() {{}},
                    onMessage: {{ addListener: function() {{}}, removeListener: function() {{}} }}
                }},
                app: {{ isInstalled: false }},
                csi: function() {{}},
                loadTimes: function() {{ return {{ navigationType: "Other", connectionInfo: "h2" }}; }}
            }};
        }}

        const originalQuery = window.navigator.permissions.query;
        window.navigator.permissions.query = (parameters) => (
            parameters.name === 'notifications' ?
            Promise.resolve({{ state: Notification.permission }}) :
            originalQuery(parameters)
        );

        ['RTCPeerConnection', 'webkitRTCPeerConnection'].forEach(className => {{
            if (window[className]) {{ window[className] = undefined; }}
        }});

        const originalToDataURL = HTMLCanvasElement.prototype.toDataURL;
        HTMLCanvasElement.prototype.toDataURL = function(...args) {{
            if (this.width > 16 && this.height > 16) {{
                const context = this.getContext('2d');
                if (context) {{
                    const imageData = context.getImageData(0, 0, this.width, this.height);
                    for (let i = 0; i < 5; i++) {{
                        const x = Math.floor(Math.random() * this.width);
                        const y = Math.floor(Math.random() * this.height);
                        const idx = (y * this.width + x) * 4;
                        if (imageData.data[idx + 3] > 0) {{
                            imageData.data[idx + 3] = Math.max(0, Math.min(255, imageData.data[idx + 3] + (Math.random() > 0.5 ? 1 : -1)));
                        }}
                    }}
                    context.putImageData(imageData, 0, 0);
                }}
            }}
            return originalToDataURL.apply(this, args);
        }};

        const getParameter = WebGLRenderingContext.prototype.getParameter;
        WebGLRenderingContext.prototype.getParameter = function(parameter) {{
            if (parameter === 37445) return '{vendor}';
            if (parameter === 37446) return '{renderer}';
            return getParameter.apply(this, [parameter]);
        }};

        Object.defineProperty(navigator, 'plugins', {{
            get: () => {{
                const pdf = {{
                    0: {{ type: "application/x-google-chrome-pdf", suffixes: "pdf", description: "Portable Document Format" }},
                    description: "Portable Document Format",
                    filename: "internal-pdf-viewer",
                    length: 1,
                    name: "Chrome PDF Plugin"
                }};
                const p = [pdf];
                Object.setPrototypeOf(p, PluginArray.prototype);
                return p;
            }}
        }});
    "#,
        cores = profile.hardware_concurrency,
        memory = profile.device_memory,
        locale = js_escape(&profile.locale),
        vendor = js_escape(&profile.webgl_vendor),
        renderer = js_escape(&profile.webgl_renderer),
    )
}

fn js_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stealth_script_generation() {
        let script = stealth_script(&StealthProfile::default());
        assert!(script.contains("Object.defineProperty(navigator, 'webdriver'"));
        assert!(script.contains("get: () => 8"));
        assert!(script.contains("return 'Intel Inc.'"));
    }

    #[test]
    fn test_profile_values_are_escaped() {
        let profile = StealthProfile {
            webgl_renderer: "it's".to_string(),
            ..Default::default()
        };
        assert!(stealth_script(&profile).contains("return 'it\\'s'"));
    }
}
