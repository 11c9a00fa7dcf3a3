//! Motor control and estimation core.
//!
//! Commutates and regulates brushless motors (six-step BLDC, sensored or
//! sensorless, and PMSM field-oriented control) behind a narrow HAL trait.
//! The crate sits between application setpoint commands and the PWM/ADC/GPIO
//! layer of a drive board: construct a [`motor::Motor`] from a validated
//! [`config::MotorConfig`], pick a driver variant, then call
//! [`motor::Motor::run`] once per control period from the control interrupt.
//!
//! Everything is synchronous and bounded-time: no allocation, no blocking,
//! no internal timing sources beyond the caller-supplied `dt`.

#![cfg_attr(not(test), no_std)]

// This module must come first so the others see its macros.
pub(crate) mod fmt;

pub mod config;
pub mod driver;
pub mod error;
pub mod hal;
pub mod motor;
pub mod observer;
pub mod pid;
pub mod pll;
pub mod shared;
pub mod svpwm;
pub mod transforms;

pub use crate::config::{ControlMethod, ControlMode, MotorConfig, MotorType};
pub use crate::driver::foc::FocDriver;
pub use crate::driver::six_step::{SixStepSensored, SixStepSensorless};
pub use crate::driver::{Direction, MotorContext, MotorDriver};
pub use crate::error::MotorError;
pub use crate::hal::MotorHal;
pub use crate::motor::{Motor, MotorMode, MotorState, Setpoint};
pub use crate::observer::{Observer, ObserverInput, ObserverKind};
pub use crate::shared::SharedSetpoint;
