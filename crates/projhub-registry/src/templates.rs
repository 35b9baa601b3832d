//! Project templates materialized into a new project's filesystem.

use projhub_core::{ProjectError, ProjectFilesystem};
use tracing::debug;

/// Path of the tutorial file written when `add_tut_file` is set.
pub const TUTORIAL_FILE_PATH: &str = "/learn.tut.ix";

struct TemplateFile {
    path: &'static str,
    content: &'static [u8],
}

const EMPTY: &[TemplateFile] = &[];

const WEB_APP_MIN: &[TemplateFile] = &[
    TemplateFile {
        path: "/main.ix",
        content: include_bytes!("../templates/web-app-min/main.ix"),
    },
    TemplateFile {
        path: "/routes/index.ix",
        content: include_bytes!("../templates/web-app-min/routes/index.ix"),
    },
    TemplateFile {
        path: "/static/base.css",
        content: include_bytes!("../templates/web-app-min/static/base.css"),
    },
    TemplateFile {
        path: "/static/index.js",
        content: include_bytes!("../templates/web-app-min/static/index.js"),
    },
];

fn template_files(name: &str) -> Option<&'static [TemplateFile]> {
    match name {
        "web-app-min" => Some(WEB_APP_MIN),
        "empty" => Some(EMPTY),
        _ => None,
    }
}

/// Names of the available templates.
pub fn template_names() -> &'static [&'static str] {
    &["empty", "web-app-min"]
}

/// Write the files of template `name` into `target`.
pub async fn write_template(
    name: &str,
    target: &dyn ProjectFilesystem,
) -> Result<(), ProjectError> {
    let files = template_files(name)
        .ok_or_else(|| ProjectError::InvalidInput(format!("unknown template: {}", name)))?;

    for file in files {
        target.write_file(file.path, file.content).await?;
    }
    debug!("Wrote template {} ({} files)", name, files.len());
    Ok(())
}
