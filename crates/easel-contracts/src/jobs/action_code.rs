use std::fmt;
use std::str::FromStr;

/// Follow-up operations the remote service offers on a finished grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCode {
    Upsample1,
    Upsample2,
    Upsample3,
    Upsample4,
    Variation1,
    Variation2,
    Variation3,
    Variation4,
    Reroll,
    ZoomOut15,
    ZoomOut2,
    PanUp,
    PanDown,
    PanLeft,
    PanRight,
    UpscaleCreative,
    UpscaleSubtle,
    RedoUpscaleCreative,
    RedoUpscaleSubtle,
    MakeSquare,
}

impl ActionCode {
    pub const ALL: [ActionCode; 20] = [
        ActionCode::Upsample1,
        ActionCode::Upsample2,
        ActionCode::Upsample3,
        ActionCode::Upsample4,
        ActionCode::Variation1,
        ActionCode::Variation2,
        ActionCode::Variation3,
        ActionCode::Variation4,
        ActionCode::Reroll,
        ActionCode::ZoomOut15,
        ActionCode::ZoomOut2,
        ActionCode::PanUp,
        ActionCode::PanDown,
        ActionCode::PanLeft,
        ActionCode::PanRight,
        ActionCode::UpscaleCreative,
        ActionCode::UpscaleSubtle,
        ActionCode::RedoUpscaleCreative,
        ActionCode::RedoUpscaleSubtle,
        ActionCode::MakeSquare,
    ];

    /// Wire form, matching what the remote service expects in `action` and
    /// lists back in `components`.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionCode::Upsample1 => "upsample1",
            ActionCode::Upsample2 => "upsample2",
            ActionCode::Upsample3 => "upsample3",
            ActionCode::Upsample4 => "upsample4",
            ActionCode::Variation1 => "variation1",
            ActionCode::Variation2 => "variation2",
            ActionCode::Variation3 => "variation3",
            ActionCode::Variation4 => "variation4",
            ActionCode::Reroll => "reroll",
            ActionCode::ZoomOut15 => "zoom_out_1.5",
            ActionCode::ZoomOut2 => "zoom_out_2",
            ActionCode::PanUp => "pan_up",
            ActionCode::PanDown => "pan_down",
            ActionCode::PanLeft => "pan_left",
            ActionCode::PanRight => "pan_right",
            ActionCode::UpscaleCreative => "upscale_creative",
            ActionCode::UpscaleSubtle => "upscale_subtle",
            ActionCode::RedoUpscaleCreative => "redo_upscale_creative",
            ActionCode::RedoUpscaleSubtle => "redo_upscale_subtle",
            ActionCode::MakeSquare => "make_square",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ActionCode::Upsample1 => "upscale image 1 of the grid",
            ActionCode::Upsample2 => "upscale image 2 of the grid",
            ActionCode::Upsample3 => "upscale image 3 of the grid",
            ActionCode::Upsample4 => "upscale image 4 of the grid",
            ActionCode::Variation1 => "create variations of image 1",
            ActionCode::Variation2 => "create variations of image 2",
            ActionCode::Variation3 => "create variations of image 3",
            ActionCode::Variation4 => "create variations of image 4",
            ActionCode::Reroll => "re-run the original prompt",
            ActionCode::ZoomOut15 => "zoom out 1.5x",
            ActionCode::ZoomOut2 => "zoom out 2x",
            ActionCode::PanUp => "pan the image up",
            ActionCode::PanDown => "pan the image down",
            ActionCode::PanLeft => "pan the image left",
            ActionCode::PanRight => "pan the image right",
            ActionCode::UpscaleCreative => "creative upscale of the selected image",
            ActionCode::UpscaleSubtle => "subtle upscale of the selected image",
            ActionCode::RedoUpscaleCreative => "redo the creative upscale",
            ActionCode::RedoUpscaleSubtle => "redo the subtle upscale",
            ActionCode::MakeSquare => "outpaint the image to a square",
        }
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionCode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        ActionCode::ALL
            .into_iter()
            .find(|code| code.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown action code '{raw}'; expected one of: {}",
                    ActionCode::ALL.map(|code| code.as_str()).join(", ")
                )
            })
    }
}

/// Remote generation speed tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Relax,
    #[default]
    Fast,
    Turbo,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Relax => "relax",
            Mode::Fast => "fast",
            Mode::Turbo => "turbo",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "relax" => Ok(Mode::Relax),
            "fast" => Ok(Mode::Fast),
            "turbo" => Ok(Mode::Turbo),
            other => Err(format!("unknown mode '{other}'; expected relax, fast or turbo")),
        }
    }
}
