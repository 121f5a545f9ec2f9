// External tools used during installation
//
// - SqlGenerator: turns a definition file into `<tables_sql>/<table>.sql` (run from the tools dir)
// - SqlApplier: sources a generated SQL file with the privileged account
//
// Both are traits so the orchestrator can be driven by scripted fakes in tests.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::installation::{run_command, CommandOutput, CommandSpec};
use crate::models::settings::{DatabaseSettings, ToolSettings};

#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, definition: &Path) -> Result<CommandOutput>;
}

#[async_trait]
pub trait SqlApplier: Send + Sync {
    async fn apply(&self, sql_file: &Path) -> Result<CommandOutput>;
}

/// `<generator_program> <generator_args...> < <definition>`, run from the tools directory.
pub struct ExternalSqlGenerator {
    program: String,
    args: Vec<String>,
    tools_dir: PathBuf,
    timeout: Duration,
}

impl ExternalSqlGenerator {
    pub fn new(tools: &ToolSettings, tools_dir: PathBuf) -> Self {
        Self {
            program: tools.generator_program.clone(),
            args: tools.generator_args.clone(),
            tools_dir,
            timeout: Duration::from_secs(tools.generate_timeout_secs),
        }
    }

    fn command(&self, definition: &Path) -> CommandSpec {
        CommandSpec::new(&self.program, "generate_sql")
            .args(self.args.iter().cloned())
            .current_dir(&self.tools_dir)
            .stdin_from(definition)
            .timeout(self.timeout)
    }
}

#[async_trait]
impl SqlGenerator for ExternalSqlGenerator {
    async fn generate(&self, definition: &Path) -> Result<CommandOutput> {
        run_command(&self.command(definition)).await
    }
}

/// `mysql -h<host> -P<port> -u<quat_user> -p<quat_password> <database> < <sql_file>`.
///
/// Arguments are passed directly to the child (no shell), so credentials need no quoting.
pub struct MysqlSqlApplier {
    program: String,
    host: String,
    port: u16,
    database: String,
    user: String,
    password: String,
    timeout: Duration,
}

impl MysqlSqlApplier {
    /// `None` when the privileged credentials are not configured.
    pub fn from_settings(tools: &ToolSettings, db: &DatabaseSettings) -> Option<Self> {
        let (user, password) = db.quat_credentials()?;
        Some(Self {
            program: tools.apply_program.clone(),
            host: db.host.clone(),
            port: db.port,
            database: db.database.clone(),
            user: user.to_string(),
            password: password.to_string(),
            timeout: Duration::from_secs(tools.apply_timeout_secs),
        })
    }

    fn command(&self, sql_file: &Path) -> CommandSpec {
        CommandSpec::new(&self.program, "apply_sql")
            .args([
                format!("-h{}", self.host),
                format!("-P{}", self.port),
                format!("-u{}", self.user),
                format!("-p{}", self.password),
                self.database.clone(),
            ])
            .stdin_from(sql_file)
            .timeout(self.timeout)
    }
}

#[async_trait]
impl SqlApplier for MysqlSqlApplier {
    async fn apply(&self, sql_file: &Path) -> Result<CommandOutput> {
        run_command(&self.command(sql_file)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_settings() -> DatabaseSettings {
        DatabaseSettings {
            host: "db.local".to_string(),
            port: 3307,
            database: "LORIS".to_string(),
            username: "lorisuser".to_string(),
            password: "pw".to_string(),
            quat_user: Some("quat".to_string()),
            quat_password: Some("it's \"secret\"".to_string()),
            connect_timeout_secs: 5,
        }
    }

    #[test]
    fn applier_requires_privileged_credentials() {
        let mut db = db_settings();
        db.quat_user = None;
        assert!(MysqlSqlApplier::from_settings(&ToolSettings::default(), &db).is_none());
    }

    #[test]
    fn applier_command_line_passes_credentials_verbatim() {
        let applier = MysqlSqlApplier::from_settings(&ToolSettings::default(), &db_settings()).unwrap();
        let spec = applier.command(Path::new("/srv/project/tables_sql/bmi.sql"));
        assert_eq!(spec.program, "mysql");
        assert_eq!(
            spec.args,
            vec!["-hdb.local", "-P3307", "-uquat", "-pit's \"secret\"", "LORIS"]
        );
        assert_eq!(
            spec.stdin_file.as_deref(),
            Some(Path::new("/srv/project/tables_sql/bmi.sql"))
        );
        assert_eq!(spec.timeout, Duration::from_secs(300));
    }

    #[test]
    fn generator_runs_from_tools_dir_with_definition_on_stdin() {
        let generator = ExternalSqlGenerator::new(&ToolSettings::default(), PathBuf::from("/srv/tools"));
        let spec = generator.command(Path::new("/srv/project/instruments/bmi.linst"));
        assert_eq!(spec.program, "php");
        assert_eq!(spec.args, vec!["generate_tables_sql_and_testNames.php"]);
        assert_eq!(spec.working_dir.as_deref(), Some(Path::new("/srv/tools")));
        assert_eq!(
            spec.stdin_file.as_deref(),
            Some(Path::new("/srv/project/instruments/bmi.linst"))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn generator_output_is_returned_even_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("x.linst");
        std::fs::write(&def, "text{@}a\n").unwrap();
        let tools = ToolSettings {
            generator_program: "sh".to_string(),
            generator_args: vec!["-c".to_string(), "cat; exit 1".to_string()],
            ..ToolSettings::default()
        };
        let out = ExternalSqlGenerator::new(&tools, dir.path().to_path_buf())
            .generate(&def)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(1));
        assert_eq!(out.stdout, "text{@}a\n");
    }
}
