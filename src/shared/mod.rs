// Copyright 2024-Present the faultline contributors
// SPDX-License-Identifier: Apache-2.0

pub mod configuration;
pub mod constants;
pub mod error;
