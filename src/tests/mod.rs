// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod common;
pub mod recovery;
pub mod resilience;
