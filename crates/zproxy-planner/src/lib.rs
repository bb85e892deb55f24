// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The planner layer: tool registry, planner system prompt, model-output
//! parsing (planner JSON, raw tool-call arrays, lax repair), and free-text
//! heuristics for when the model fails to produce structured output.

pub mod heuristics;
pub mod jsonfix;
pub mod output;
pub mod prompt;
pub mod registry;
pub mod sensitive;

pub use output::{parse_planner_output, parse_raw_tool_calls, Action, ParsedCall, PlannerOutput, Risk, Safety};
pub use prompt::{build_system_prompt, PromptOptions};
pub use registry::{normalize_name, ToolInfo, ToolRegistry};
