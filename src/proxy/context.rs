//! Context strings describing the command in flight.
use crate::plugin::{Parameter, Perception, PluginResult};
use std::fmt::{Display, Write};

/// Builder of a context string:
///
/// ```text
/// Method: learn
/// Parameters:
///     - Number of actions: 4
/// ```
#[derive(Debug, Clone)]
pub struct CommandContext {
    text: String,
    has_parameters: bool,
}

impl CommandContext {
    pub fn method(name: &str) -> Self {
        Self {
            text: format!("Method: {name}\n"),
            has_parameters: false,
        }
    }

    pub fn parameter(self, label: &str, value: impl Display) -> Self {
        self.item(format_args!("{label}: {value}"))
    }

    pub fn item(mut self, text: impl Display) -> Self {
        if !self.has_parameters {
            self.text.push_str("Parameters:\n");
            self.has_parameters = true;
        }
        let _ = writeln!(self.text, "    - {text}");
        self
    }

    /// One line per experiment parameter: its name, then its arguments.
    pub fn parameters(mut self, parameters: &[Parameter]) -> Self {
        if parameters.is_empty() {
            self.text.push_str("No parameters\n");
            return self;
        }
        for parameter in parameters {
            let mut line = parameter.name.clone();
            for argument in &parameter.arguments {
                line.push(' ');
                line.push_str(argument);
            }
            self = self.item(line);
        }
        self
    }

    /// Sizes of what a perception shows, as far as it can tell.
    pub fn perception(self, perception: &mut dyn Perception) -> Self {
        let nb_views = count(perception.nb_views());
        let nb_heuristics = perception.nb_heuristics();
        let nb_features = nb_heuristics.clone().and_then(|nb_heuristics| {
            (0..nb_heuristics).try_fold(0u32, |total, heuristic| {
                Ok(total.saturating_add(perception.nb_features(heuristic)?))
            })
        });
        self.parameter("Number of views", nb_views)
            .parameter("Number of heuristics", count(nb_heuristics))
            .parameter("Number of features", count(nb_features))
    }

    pub fn finish(self) -> String {
        self.text
    }
}

fn count(value: PluginResult<u32>) -> String {
    match value {
        Ok(value) => value.to_string(),
        Err(_) => "?".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_header_is_written_once() {
        let context = CommandContext::method("init")
            .parameter("Number of views", 2)
            .parameter("ROI extent", "10 pixels")
            .finish();
        assert_eq!(
            context,
            "Method: init\nParameters:\n    - Number of views: 2\n    - ROI extent: 10 pixels\n"
        );
    }

    #[test]
    fn setup_lists_parameters_with_arguments() {
        let context = CommandContext::method("setup")
            .parameters(&[Parameter::new("depth", ["3"]), Parameter::new("fast", Vec::<String>::new())])
            .finish();
        assert_eq!(context, "Method: setup\nParameters:\n    - depth 3\n    - fast\n");

        let empty = CommandContext::method("setup").parameters(&[]).finish();
        assert_eq!(empty, "Method: setup\nNo parameters\n");
    }

    #[test]
    fn bare_method_has_no_parameters_section() {
        assert_eq!(CommandContext::method("loading").finish(), "Method: loading\n");
    }
}
