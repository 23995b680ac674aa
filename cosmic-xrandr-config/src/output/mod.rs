// SPDX-License-Identifier: GPL-3.0-only

/// Per-connector output configurations, as persisted by cosmic-xrandr
pub mod comp;
