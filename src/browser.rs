use crate::action::MouseButton;
use crate::dispatch::{InputDriver, InputError};
use crate::screen::{CaptureError, EncodedImage, ImageFormat, ScreenCapture};
use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventParamsBuilder, DispatchMouseEventType, InsertTextParams, MouseButton as CdpButton,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::{debug, info};

/// Pixels per wheel click.
const WHEEL_DELTA: f64 = 100.0;
const DRAG_STEPS: i32 = 10;

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None, viewport: (1280, 800) }
    }
}

/// A single Chromium page driven over CDP. Doubles as the screen and the
/// input device, with the viewport as the display.
pub struct Browser {
    page: Page,
    viewport: (u32, u32),
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // fresh profile per run, Chromium locks a reused one
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("deskpilot-profile-{}-{}", std::process::id(), ts));
        std::fs::create_dir_all(&profile_dir)?;
        builder = builder
            .user_data_dir(profile_dir)
            .window_size(cfg.viewport.0, cfg.viewport.1)
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        info!(headless = cfg.headless, width = cfg.viewport.0, height = cfg.viewport.1, "chromium launched");
        Self::ready(browser, page, cfg.viewport).await
    }

    /// Attach to a running Chromium via its DevTools websocket URL.
    pub async fn connect(ws_url: &str, viewport: (u32, u32)) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = match browser.pages().await?.into_iter().next() {
            Some(p) => p,
            None => browser.new_page("about:blank").await?,
        };
        info!(url = ws_url, "attached to chromium");
        Self::ready(browser, page, viewport).await
    }

    async fn ready(browser: OxideBrowser, page: Page, viewport: (u32, u32)) -> Result<Self> {
        let this = Self { page, viewport, _browser: browser };
        this.pin_viewport().await?;
        Ok(this)
    }

    // a zero-sized viewport makes screenshots fail
    async fn pin_viewport(&self) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(self.viewport.0 as i64)
            .height(self.viewport.1 as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.page.execute(params).await?;
        Ok(())
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn mouse(&self, params: DispatchMouseEventParamsBuilder) -> Result<(), InputError> {
        let cmd = params.build().map_err(InputError)?;
        self.page.execute(cmd).await.map_err(|e| InputError(e.to_string()))?;
        Ok(())
    }

    async fn key(&self, kind: DispatchKeyEventType, key: &DomKey, modifiers: i64) -> Result<(), InputError> {
        let mut b = DispatchKeyEventParams::builder()
            .r#type(kind.clone())
            .key(key.key.clone())
            .code(key.code.clone())
            .modifiers(modifiers);
        if let Some(vk) = key.virtual_code {
            b = b.windows_virtual_key_code(vk).native_virtual_key_code(vk);
        }
        // text only on keydown and only without ctrl/alt/meta
        if kind == DispatchKeyEventType::KeyDown && modifiers & !SHIFT == 0 {
            if let Some(t) = &key.text {
                b = b.text(t.clone());
            }
        }
        let cmd = b.build().map_err(InputError)?;
        self.page.execute(cmd).await.map_err(|e| InputError(e.to_string()))?;
        Ok(())
    }

    fn mouse_at(x: i32, y: i32) -> DispatchMouseEventParamsBuilder {
        DispatchMouseEventParams::builder().x(x as f64).y(y as f64)
    }
}

/// Viewport-only PNG. Built fresh per attempt since the params are consumed.
fn screenshot_params() -> ScreenshotParams {
    ScreenshotParams::builder()
        .format(CaptureScreenshotFormat::Png)
        .full_page(false)
        .build()
}

#[async_trait]
impl ScreenCapture for Browser {
    async fn capture(&self) -> Result<EncodedImage, CaptureError> {
        let bytes = match self.page.screenshot(screenshot_params()).await {
            Ok(b) => b,
            Err(e) => {
                let msg = e.to_string();
                if !(msg.contains("0 width") || msg.contains("0 height")) {
                    return Err(CaptureError(msg));
                }
                debug!("empty viewport, re-pinning and retrying capture");
                self.pin_viewport().await.map_err(|e| CaptureError(e.to_string()))?;
                sleep(Duration::from_millis(50)).await;
                self.page.screenshot(screenshot_params()).await.map_err(|e| CaptureError(e.to_string()))?
            }
        };
        Ok(EncodedImage { bytes, format: ImageFormat::Png, width: self.viewport.0, height: self.viewport.1 })
    }
}

#[async_trait]
impl InputDriver for Browser {
    async fn move_to(&self, x: i32, y: i32) -> Result<(), InputError> {
        self.mouse(Self::mouse_at(x, y).r#type(DispatchMouseEventType::MouseMoved)).await
    }

    async fn click(&self, x: i32, y: i32, button: MouseButton, count: u32) -> Result<(), InputError> {
        let btn = cdp_button(button);
        self.move_to(x, y).await?;
        // Chromium wants the running click_count on each press/release pair
        for n in 1..=count.max(1) {
            let base = Self::mouse_at(x, y).button(btn.clone()).click_count(n as i64);
            self.mouse(base.clone().r#type(DispatchMouseEventType::MousePressed)).await?;
            self.mouse(base.r#type(DispatchMouseEventType::MouseReleased)).await?;
        }
        Ok(())
    }

    async fn scroll(&self, x: i32, y: i32, clicks: i32) -> Result<(), InputError> {
        // CDP: positive deltaY scrolls down
        let delta = -(clicks as f64) * WHEEL_DELTA;
        self.mouse(
            Self::mouse_at(x, y)
                .r#type(DispatchMouseEventType::MouseWheel)
                .delta_x(0.0)
                .delta_y(delta),
        )
        .await
    }

    async fn drag(&self, from: (i32, i32), to: (i32, i32)) -> Result<(), InputError> {
        self.move_to(from.0, from.1).await?;
        self.mouse(
            Self::mouse_at(from.0, from.1)
                .r#type(DispatchMouseEventType::MousePressed)
                .button(CdpButton::Left)
                .click_count(1),
        )
        .await?;
        for i in 1..=DRAG_STEPS {
            let x = from.0 + (to.0 - from.0) * i / DRAG_STEPS;
            let y = from.1 + (to.1 - from.1) * i / DRAG_STEPS;
            self.mouse(
                Self::mouse_at(x, y)
                    .r#type(DispatchMouseEventType::MouseMoved)
                    .button(CdpButton::Left)
                    .buttons(1),
            )
            .await?;
        }
        self.mouse(
            Self::mouse_at(to.0, to.1)
                .r#type(DispatchMouseEventType::MouseReleased)
                .button(CdpButton::Left)
                .click_count(1),
        )
        .await
    }

    async fn type_text(&self, text: &str) -> Result<(), InputError> {
        self.page
            .execute(InsertTextParams::new(text))
            .await
            .map_err(|e| InputError(e.to_string()))?;
        Ok(())
    }

    async fn key_chord(&self, keys: &[String]) -> Result<(), InputError> {
        let keys: Vec<DomKey> = keys.iter().map(|k| dom_key(k)).collect();
        let mut modifiers = 0;
        for k in &keys {
            let kind = if k.text.is_some() { DispatchKeyEventType::KeyDown } else { DispatchKeyEventType::RawKeyDown };
            modifiers |= k.modifier;
            self.key(kind, k, modifiers).await?;
        }
        for k in keys.iter().rev() {
            self.key(DispatchKeyEventType::KeyUp, k, modifiers).await?;
            modifiers &= !k.modifier;
        }
        Ok(())
    }
}

fn cdp_button(b: MouseButton) -> CdpButton {
    match b {
        MouseButton::Right => CdpButton::Right,
        MouseButton::Middle | MouseButton::Wheel => CdpButton::Middle,
        MouseButton::Back => CdpButton::Back,
        MouseButton::Forward => CdpButton::Forward,
        MouseButton::Left => CdpButton::Left,
    }
}

// ========================= Key mapping =========================

const ALT: i64 = 1;
const CTRL: i64 = 2;
const META: i64 = 4;
const SHIFT: i64 = 8;

#[derive(Clone, Debug, PartialEq)]
struct DomKey {
    key: String,
    code: String,
    virtual_code: Option<i64>,
    text: Option<String>,
    modifier: i64,
}

/// Translate a canonical key name into the DOM `key`/`code` pair CDP expects.
fn dom_key(name: &str) -> DomKey {
    let named = |key: &str, code: &str, vk: i64, modifier: i64, text: Option<&str>| DomKey {
        key: key.to_string(),
        code: code.to_string(),
        virtual_code: Some(vk),
        text: text.map(String::from),
        modifier,
    };
    match name {
        "ctrl" => named("Control", "ControlLeft", 17, CTRL, None),
        "shift" => named("Shift", "ShiftLeft", 16, SHIFT, None),
        "alt" => named("Alt", "AltLeft", 18, ALT, None),
        "win" => named("Meta", "MetaLeft", 91, META, None),
        "enter" => named("Enter", "Enter", 13, 0, Some("\r")),
        "tab" => named("Tab", "Tab", 9, 0, None),
        "escape" => named("Escape", "Escape", 27, 0, None),
        "backspace" => named("Backspace", "Backspace", 8, 0, None),
        "delete" => named("Delete", "Delete", 46, 0, None),
        "space" => named(" ", "Space", 32, 0, Some(" ")),
        "up" => named("ArrowUp", "ArrowUp", 38, 0, None),
        "down" => named("ArrowDown", "ArrowDown", 40, 0, None),
        "left" => named("ArrowLeft", "ArrowLeft", 37, 0, None),
        "right" => named("ArrowRight", "ArrowRight", 39, 0, None),
        "home" => named("Home", "Home", 36, 0, None),
        "end" => named("End", "End", 35, 0, None),
        "pageup" => named("PageUp", "PageUp", 33, 0, None),
        "pagedown" => named("PageDown", "PageDown", 34, 0, None),
        "slash" => named("/", "Slash", 191, 0, Some("/")),
        "backslash" => named("\\", "Backslash", 220, 0, Some("\\")),
        _ => {
            if let Some(n) = name.strip_prefix('f').and_then(|n| n.parse::<i64>().ok()) {
                if (1..=24).contains(&n) {
                    return named(&format!("F{}", n), &format!("F{}", n), 111 + n, 0, None);
                }
            }
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => {
                    let upper = c.to_ascii_uppercase();
                    named(name, &format!("Key{}", upper), upper as i64, 0, Some(name))
                }
                (Some(c), None) if c.is_ascii_digit() => named(name, &format!("Digit{}", c), c as i64, 0, Some(name)),
                (Some(_), None) => DomKey {
                    key: name.to_string(),
                    code: String::new(),
                    virtual_code: None,
                    text: Some(name.to_string()),
                    modifier: 0,
                },
                _ => DomKey { key: name.to_string(), code: name.to_string(), virtual_code: None, text: None, modifier: 0 },
            }
        }
    }
}
