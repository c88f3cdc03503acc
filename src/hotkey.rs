//! Global hotkey registration and activation dispatch.
//!
//! The registry owns the single OS-level binding. Raw key events are turned
//! into logical activations by [`ActivationFilter`]: one activation per
//! physical press, with OS auto-repeat suppressed while the key is held.

use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyManager, HotKeyState};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum HotkeyError {
    /// Input-monitoring/accessibility grant is missing
    #[error("input monitoring permission denied: {0}")]
    PermissionDenied(String),
    /// Binding already owned by another registrant
    #[error("hotkey registration conflict: {0}")]
    Conflict(String),
    /// OS call failed
    #[error("hotkey platform error: {0}")]
    Platform(String),
    /// Binding string could not be parsed
    #[error("invalid hotkey binding {binding:?}: unknown token {token:?}")]
    Parse { binding: String, token: String },
    /// Swapping bindings failed both ways; nothing is registered anymore
    #[error(
        "no binding active: registering {new} failed ({new_error}) and the previous \
         binding could not be restored ({restore_error})"
    )]
    NoBindingActive {
        new: String,
        new_error: String,
        restore_error: String,
    },
}

fn map_register_error(e: global_hotkey::Error) -> HotkeyError {
    match e {
        global_hotkey::Error::AlreadyRegistered(hotkey) => {
            HotkeyError::Conflict(format!("{hotkey:?} is already registered"))
        }
        global_hotkey::Error::OsError(os) if os.kind() == std::io::ErrorKind::PermissionDenied => {
            HotkeyError::PermissionDenied(os.to_string())
        }
        other => HotkeyError::Platform(other.to_string()),
    }
}

/// One global key combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotkeyBinding {
    /// Canonical config spelling, e.g. "meta+shift+space". Unique per
    /// binding; used to recognize re-registration of the same binding.
    pub identifier: String,
    pub key: Code,
    pub modifiers: Modifiers,
    /// Display form, e.g. "Meta+Shift+Space"
    pub description: String,
}

impl HotkeyBinding {
    /// Parse a `modifier+modifier+key` spec, case-insensitively.
    pub fn parse(spec: &str) -> Result<Self, HotkeyError> {
        let tokens: Vec<String> = spec
            .split('+')
            .map(|t| t.trim().to_ascii_lowercase())
            .collect();
        let parse_err = |token: &str| HotkeyError::Parse {
            binding: spec.to_string(),
            token: token.to_string(),
        };

        let (key_token, modifier_tokens) = tokens.split_last().ok_or_else(|| parse_err(spec))?;

        let mut modifiers = Modifiers::empty();
        for token in modifier_tokens {
            modifiers |= match token.as_str() {
                "meta" | "cmd" | "command" | "super" => Modifiers::META,
                "ctrl" | "control" => Modifiers::CONTROL,
                "alt" | "option" => Modifiers::ALT,
                "shift" => Modifiers::SHIFT,
                other => return Err(parse_err(other)),
            };
        }

        let key = parse_key(key_token).ok_or_else(|| parse_err(key_token))?;
        let identifier = tokens.join("+");
        let description = tokens
            .iter()
            .map(|t| capitalize(t))
            .collect::<Vec<_>>()
            .join("+");

        Ok(Self {
            identifier,
            key,
            modifiers,
            description,
        })
    }

    /// Default binding: Meta+Shift+Space
    pub fn default_binding() -> Self {
        Self {
            identifier: "meta+shift+space".to_string(),
            key: Code::Space,
            modifiers: Modifiers::META | Modifiers::SHIFT,
            description: "Meta+Shift+Space".to_string(),
        }
    }

    fn hotkey(&self) -> HotKey {
        HotKey::new(Some(self.modifiers), self.key)
    }
}

fn capitalize(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

fn parse_key(token: &str) -> Option<Code> {
    let code = match token {
        "space" => Code::Space,
        "enter" | "return" => Code::Enter,
        "tab" => Code::Tab,
        "escape" | "esc" => Code::Escape,
        "backspace" => Code::Backspace,
        "semicolon" => Code::Semicolon,
        "comma" => Code::Comma,
        "period" => Code::Period,
        "slash" => Code::Slash,
        "quote" => Code::Quote,
        "backquote" => Code::Backquote,
        "minus" => Code::Minus,
        "equal" => Code::Equal,
        "a" => Code::KeyA,
        "b" => Code::KeyB,
        "c" => Code::KeyC,
        "d" => Code::KeyD,
        "e" => Code::KeyE,
        "f" => Code::KeyF,
        "g" => Code::KeyG,
        "h" => Code::KeyH,
        "i" => Code::KeyI,
        "j" => Code::KeyJ,
        "k" => Code::KeyK,
        "l" => Code::KeyL,
        "m" => Code::KeyM,
        "n" => Code::KeyN,
        "o" => Code::KeyO,
        "p" => Code::KeyP,
        "q" => Code::KeyQ,
        "r" => Code::KeyR,
        "s" => Code::KeyS,
        "t" => Code::KeyT,
        "u" => Code::KeyU,
        "v" => Code::KeyV,
        "w" => Code::KeyW,
        "x" => Code::KeyX,
        "y" => Code::KeyY,
        "z" => Code::KeyZ,
        "0" => Code::Digit0,
        "1" => Code::Digit1,
        "2" => Code::Digit2,
        "3" => Code::Digit3,
        "4" => Code::Digit4,
        "5" => Code::Digit5,
        "6" => Code::Digit6,
        "7" => Code::Digit7,
        "8" => Code::Digit8,
        "9" => Code::Digit9,
        "f1" => Code::F1,
        "f2" => Code::F2,
        "f3" => Code::F3,
        "f4" => Code::F4,
        "f5" => Code::F5,
        "f6" => Code::F6,
        "f7" => Code::F7,
        "f8" => Code::F8,
        "f9" => Code::F9,
        "f10" => Code::F10,
        "f11" => Code::F11,
        "f12" => Code::F12,
        _ => return None,
    };
    Some(code)
}

/// A logical hotkey activation: one per physical press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
    pub binding_id: u32,
}

/// Turns raw hotkey events into activations, suppressing OS key-repeat.
#[derive(Debug)]
pub struct ActivationFilter {
    target: u32,
    held: bool,
}

impl ActivationFilter {
    pub fn new(target: u32) -> Self {
        Self {
            target,
            held: false,
        }
    }

    /// Point the filter at a different registration (after update_binding).
    pub fn retarget(&mut self, target: u32) {
        self.target = target;
        self.held = false;
    }

    pub fn filter(&mut self, id: u32, state: HotKeyState) -> Option<Activation> {
        if id != self.target {
            return None;
        }
        match state {
            HotKeyState::Pressed if !self.held => {
                self.held = true;
                Some(Activation { binding_id: id })
            }
            // Auto-repeat while held
            HotKeyState::Pressed => None,
            HotKeyState::Released => {
                self.held = false;
                None
            }
        }
    }
}

/// Handle returned by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    id: u32,
    identifier: String,
}

impl RegistrationHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// OS seam for the registry. Lets tests observe exactly which OS calls are
/// made without touching the real input layer.
pub trait HotkeyBackend {
    fn register(&self, hotkey: HotKey) -> Result<(), global_hotkey::Error>;
    fn unregister(&self, hotkey: HotKey) -> Result<(), global_hotkey::Error>;
}

impl HotkeyBackend for GlobalHotKeyManager {
    fn register(&self, hotkey: HotKey) -> Result<(), global_hotkey::Error> {
        GlobalHotKeyManager::register(self, hotkey)
    }

    fn unregister(&self, hotkey: HotKey) -> Result<(), global_hotkey::Error> {
        GlobalHotKeyManager::unregister(self, hotkey)
    }
}

/// Owns the single OS-level hotkey registration.
pub struct HotkeyRegistry<B: HotkeyBackend = GlobalHotKeyManager> {
    backend: B,
    active: Option<(HotkeyBinding, HotKey)>,
}

impl HotkeyRegistry<GlobalHotKeyManager> {
    /// Create a registry backed by the OS input layer. Must be called on the
    /// thread running the event loop.
    pub fn new() -> Result<Self, HotkeyError> {
        let manager = GlobalHotKeyManager::new().map_err(map_register_error)?;
        Ok(Self::with_backend(manager))
    }
}

impl<B: HotkeyBackend> HotkeyRegistry<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            backend,
            active: None,
        }
    }

    pub fn active_binding(&self) -> Option<&HotkeyBinding> {
        self.active.as_ref().map(|(binding, _)| binding)
    }

    /// Install the OS listener for a binding. At most one binding is
    /// registered at a time: the same identifier replaces its prior handle,
    /// a different identifier is a conflict (use [`Self::update_binding`]).
    pub fn register(&mut self, binding: HotkeyBinding) -> Result<RegistrationHandle, HotkeyError> {
        if let Some((active, _)) = &self.active {
            if active.identifier == binding.identifier {
                self.unregister_current()?;
            } else {
                return Err(HotkeyError::Conflict(format!(
                    "binding {} is already active",
                    active.identifier
                )));
            }
        }

        let hotkey = binding.hotkey();
        self.backend.register(hotkey).map_err(map_register_error)?;
        info!(binding = %binding.identifier, "Global hotkey registered");

        let handle = RegistrationHandle {
            id: hotkey.id(),
            identifier: binding.identifier.clone(),
        };
        self.active = Some((binding, hotkey));
        Ok(handle)
    }

    /// Remove the OS listener for a handle. Idempotent: a handle that is no
    /// longer active is a no-op and no OS deregistration is attempted.
    pub fn unregister(&mut self, handle: &RegistrationHandle) -> Result<(), HotkeyError> {
        match &self.active {
            Some((_, hotkey)) if hotkey.id() == handle.id => self.unregister_current(),
            _ => Ok(()),
        }
    }

    /// Swap the active binding for a new one. If the new registration fails
    /// the previous binding is restored; if that also fails the registry
    /// reports that no binding is active rather than leaving a stale OS
    /// registration.
    pub fn update_binding(
        &mut self,
        binding: HotkeyBinding,
    ) -> Result<RegistrationHandle, HotkeyError> {
        let previous = self.active.clone();
        self.unregister_current()?;

        let hotkey = binding.hotkey();
        match self.backend.register(hotkey) {
            Ok(()) => {
                info!(binding = %binding.identifier, "Global hotkey updated");
                let handle = RegistrationHandle {
                    id: hotkey.id(),
                    identifier: binding.identifier.clone(),
                };
                self.active = Some((binding, hotkey));
                Ok(handle)
            }
            Err(new_error) => match previous {
                Some((prev_binding, prev_hotkey)) => match self.backend.register(prev_hotkey) {
                    Ok(()) => {
                        self.active = Some((prev_binding, prev_hotkey));
                        Err(map_register_error(new_error))
                    }
                    Err(restore_error) => Err(HotkeyError::NoBindingActive {
                        new: binding.identifier,
                        new_error: new_error.to_string(),
                        restore_error: restore_error.to_string(),
                    }),
                },
                None => Err(map_register_error(new_error)),
            },
        }
    }

    fn unregister_current(&mut self) -> Result<(), HotkeyError> {
        if let Some((binding, hotkey)) = self.active.take() {
            self.backend
                .unregister(hotkey)
                .map_err(|e| HotkeyError::Platform(e.to_string()))?;
            info!(binding = %binding.identifier, "Global hotkey unregistered");
        }
        Ok(())
    }
}
