// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Middleware modules (admin authentication, security headers).

pub mod admin_auth;
pub mod security;

pub use admin_auth::require_admin;
