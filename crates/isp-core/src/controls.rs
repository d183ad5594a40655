//! 3A control request types.
//!
//! The pipeline only sequences *when* these commands are issued and
//! correlates their completion; the numeric policy behind them (AE/AF/AWB
//! math) lives in firmware.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusMode {
    Auto,
    Macro,
    Continuous,
    Manual,
}

impl FocusMode {
    pub fn wire_code(&self) -> u8 {
        match self {
            FocusMode::Auto => 0,
            FocusMode::Macro => 1,
            FocusMode::Continuous => 2,
            FocusMode::Manual => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteBalanceMode {
    Auto,
    Daylight,
    Cloudy,
    Tungsten,
    Fluorescent,
    Manual,
}

impl WhiteBalanceMode {
    pub fn wire_code(&self) -> u8 {
        match self {
            WhiteBalanceMode::Auto => 0,
            WhiteBalanceMode::Daylight => 1,
            WhiteBalanceMode::Cloudy => 2,
            WhiteBalanceMode::Tungsten => 3,
            WhiteBalanceMode::Fluorescent => 4,
            WhiteBalanceMode::Manual => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMode {
    Off,
    On,
    Auto,
    Torch,
}

impl FlashMode {
    pub fn wire_code(&self) -> u8 {
        match self {
            FlashMode::Off => 0,
            FlashMode::On => 1,
            FlashMode::Auto => 2,
            FlashMode::Torch => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneMode {
    Auto,
    Night,
    Sports,
    Portrait,
    Landscape,
}

impl SceneMode {
    pub fn wire_code(&self) -> u8 {
        match self {
            SceneMode::Auto => 0,
            SceneMode::Night => 1,
            SceneMode::Sports => 2,
            SceneMode::Portrait => 3,
            SceneMode::Landscape => 4,
        }
    }
}

/// Metering/focus region in sensor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionOfInterest {
    /// Whole-frame region, the power-on default.
    pub fn full(width: u32, height: u32) -> Self {
        RegionOfInterest {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}
