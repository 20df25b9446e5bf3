use std::fmt;
use std::io::BufRead;

use serde::Deserialize;
use view::ViewState;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ViewLocation {
    pub xc: f64,
    pub yc: f64,
    pub z: u32,
    pub s: f64,
}

impl From<ViewLocation> for ViewState {
    fn from(location: ViewLocation) -> Self {
        ViewState {
            xc: location.xc,
            yc: location.yc,
            z: location.z,
            s: location.s,
        }
    }
}

/// One line of a view script.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewStep {
    View {
        #[serde(flatten)]
        location: ViewLocation,
        #[serde(default = "default_blocking")]
        blocking: bool,
    },
    Resize {
        width: u32,
        height: u32,
    },
    Wait {
        millis: u64,
    },
    Precache {
        views: Vec<ViewLocation>,
    },
    SetOpacity {
        layer: usize,
        opacity: f32,
    },
}

fn default_blocking() -> bool {
    true
}

#[derive(Debug)]
pub enum ScriptError {
    Io(std::io::Error),
    Parse { line: usize, message: String },
}

impl fmt::Display for ScriptError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptError::Io(error) => write!(formatter, "read view script failed: {error}"),
            ScriptError::Parse { line, message } => {
                write!(formatter, "parse view step at line {line} failed: {message}")
            }
        }
    }
}

impl std::error::Error for ScriptError {}

/// Reads JSON lines; blank lines are skipped.
pub fn read_view_script(reader: &mut dyn BufRead) -> Result<Vec<ViewStep>, ScriptError> {
    let mut steps = Vec::new();
    let mut line_buffer = String::new();
    let mut line_number = 0usize;
    loop {
        line_buffer.clear();
        let bytes = reader.read_line(&mut line_buffer).map_err(ScriptError::Io)?;
        if bytes == 0 {
            break;
        }
        line_number = line_number
            .checked_add(1)
            .unwrap_or_else(|| panic!("view script line number overflow"));
        if line_buffer.trim().is_empty() {
            continue;
        }
        let step = serde_json::from_str::<ViewStep>(&line_buffer).map_err(|error| {
            ScriptError::Parse {
                line: line_number,
                message: error.to_string(),
            }
        })?;
        steps.push(step);
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_steps_and_skips_blank_lines() {
        let script = concat!(
            r#"{"kind":"view","xc":0.0,"yc":512.0,"z":3,"s":1.5}"#,
            "\n\n",
            r#"{"kind":"view","xc":10.0,"yc":0.0,"z":4,"s":0.0,"blocking":false}"#,
            "\n",
            r#"{"kind":"resize","width":800,"height":600}"#,
            "\n",
            r#"{"kind":"precache","views":[{"xc":0.0,"yc":0.0,"z":5,"s":0.0}]}"#,
            "\n",
            r#"{"kind":"wait","millis":25}"#,
            "\n",
        );
        let steps = read_view_script(&mut script.as_bytes()).expect("read script");
        assert_eq!(steps.len(), 5);
        assert_eq!(
            steps[0],
            ViewStep::View {
                location: ViewLocation {
                    xc: 0.0,
                    yc: 512.0,
                    z: 3,
                    s: 1.5,
                },
                blocking: true,
            }
        );
        assert!(matches!(steps[1], ViewStep::View { blocking: false, .. }));
        assert_eq!(
            steps[2],
            ViewStep::Resize {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn reports_line_of_bad_step() {
        let script = "{\"kind\":\"wait\",\"millis\":1}\n\n{\"kind\":\"teleport\"}\n";
        let error = read_view_script(&mut script.as_bytes()).expect_err("unknown kind");
        assert!(matches!(error, ScriptError::Parse { line: 3, .. }));
    }
}
