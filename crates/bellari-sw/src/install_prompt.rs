//! Add-to-home-screen banner state.
//!
//! The page shows one of two banners: the install banner when the browser
//! offers a deferred install prompt, or manual instructions on iOS, which
//! never offers one.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use hashbrown::HashMap;
use tracing::info;

/// Delay before the iOS instructions appear.
pub const IOS_PROMPT_DELAY: Duration = Duration::from_secs(3);

/// Storage key recording that the iOS instructions were dismissed.
pub const IOS_PROMPT_SHOWN_KEY: &str = "pwa_ios_prompt_shown";

/// Persistent key-value store backing the banner (localStorage).
pub trait PromptStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str);
}

impl PromptStore for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), value.to_string());
    }
}

/// What the page knows about the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Platform {
    pub is_ios: bool,
    /// Already launched from the home screen.
    pub standalone: bool,
}

impl Platform {
    pub fn detect(user_agent: &str, standalone: bool) -> Self {
        let ua = user_agent.to_lowercase();
        Self {
            is_ios: ["iphone", "ipad", "ipod"].iter().any(|d| ua.contains(d)),
            standalone,
        }
    }
}

/// The user's answer to the install prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Accepted,
    Dismissed,
}

impl FromStr for InstallOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(format!("unknown install outcome {other:?}")),
        }
    }
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accepted => "accepted",
            Self::Dismissed => "dismissed",
        })
    }
}

/// Banner controller. `P` is the browser's deferred prompt handle.
#[derive(Debug)]
pub struct InstallBanner<S, P> {
    platform: Platform,
    store: S,
    deferred: Option<P>,
    awaiting_choice: bool,
    install_visible: bool,
    ios_visible: bool,
}

impl<S: PromptStore, P> InstallBanner<S, P> {
    pub fn new(platform: Platform, store: S) -> Self {
        Self {
            platform,
            store,
            deferred: None,
            awaiting_choice: false,
            install_visible: false,
            ios_visible: false,
        }
    }

    pub fn install_visible(&self) -> bool {
        self.install_visible
    }

    pub fn ios_instructions_visible(&self) -> bool {
        self.ios_visible
    }

    pub fn has_deferred_prompt(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// How long to wait before [`show_ios_instructions`], or `None` if they
    /// should not be shown at all.
    ///
    /// [`show_ios_instructions`]: Self::show_ios_instructions
    pub fn ios_prompt_delay(&self) -> Option<Duration> {
        let dismissed = self.store.get(IOS_PROMPT_SHOWN_KEY).is_some();
        let wanted = self.platform.is_ios && !self.platform.standalone && !dismissed;
        wanted.then_some(IOS_PROMPT_DELAY)
    }

    /// Timer fired.
    pub fn show_ios_instructions(&mut self) {
        if self.ios_prompt_delay().is_some() {
            self.ios_visible = true;
        }
    }

    /// Close the iOS instructions for good.
    pub fn close_ios_instructions(&mut self) {
        self.ios_visible = false;
        self.store.set(IOS_PROMPT_SHOWN_KEY, "true");
    }

    /// `beforeinstallprompt`: stash the prompt and show the banner.
    pub fn before_install_prompt(&mut self, prompt: P) {
        self.deferred = Some(prompt);
        self.awaiting_choice = false;
        self.install_visible = true;
    }

    /// Install button clicked: hide the banner and hand out the stashed
    /// prompt so the caller can show it. Yields it at most once.
    pub fn install_clicked(&mut self) -> Option<&mut P> {
        self.install_visible = false;
        if self.awaiting_choice {
            return None;
        }
        let prompt = self.deferred.as_mut()?;
        self.awaiting_choice = true;
        Some(prompt)
    }

    /// The user answered the prompt. The handle cannot be reused.
    pub fn choice_made(&mut self, outcome: InstallOutcome) {
        match outcome {
            InstallOutcome::Accepted => info!("User accepted the A2HS prompt"),
            InstallOutcome::Dismissed => info!("User dismissed the A2HS prompt"),
        }
        self.deferred = None;
        self.awaiting_choice = false;
    }

    /// Close button on the install banner.
    pub fn close_clicked(&mut self) {
        self.install_visible = false;
    }
}
