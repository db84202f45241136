//! HTML pages served by the gateway

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use qrcode::QrCode;
use qrcode::render::svg;

/// Browser test page driving the JSON endpoints.
pub const TEST_PAGE: &str = include_str!("../../static/test.html");

/// Render a pairing code as an SVG `data:` URL.
pub fn qr_data_url(code: &str) -> Result<String> {
    let qr = QrCode::new(code.as_bytes())?;
    let image = qr
        .render::<svg::Color>()
        .min_dimensions(280, 280)
        .quiet_zone(true)
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(image.as_bytes())
    ))
}

/// Scan page for a pending pairing code. Redirects to `/status` after 30s.
pub fn qr_page(code: &str) -> Result<String> {
    let image = qr_data_url(code)?;
    Ok(format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>WhatsApp QR Code</title>
    <style>
        body {{ font-family: Arial, sans-serif; text-align: center; padding: 20px; background: #f0f0f0; }}
        .container {{ background: white; padding: 30px; border-radius: 10px; display: inline-block; box-shadow: 0 4px 6px rgba(0,0,0,0.1); }}
        .steps {{ text-align: left; max-width: 300px; margin: 20px auto; }}
        .step {{ margin: 10px 0; padding: 8px; background: #e8f5e8; border-radius: 5px; }}
        img {{ border: 2px solid #25D366; border-radius: 8px; }}
    </style>
    <script>
        setTimeout(() => {{ window.location.href = '/status'; }}, 30000);
    </script>
</head>
<body>
<div class="container">
    <h2>Scan with WhatsApp</h2>
    <img src="{image}" alt="QR Code">
    <div class="steps">
        <div class="step">1. Open WhatsApp on your phone</div>
        <div class="step">2. Go to Settings</div>
        <div class="step">3. Tap "Linked devices"</div>
        <div class="step">4. Tap "Link a device"</div>
        <div class="step">5. Scan the code above</div>
    </div>
    <p style="color: #666; font-size: 12px;">
        The code is replaced every 20 to 60 seconds. This page moves to /status in 30 seconds.
    </p>
</div>
</body>
</html>
"#
    ))
}
