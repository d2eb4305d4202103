//! End-to-end tests of the standard pipeline against temporary repositories.

#[cfg(test)]
mod tests {
    use crate::bootstrap::{BootstrapContext, Pipeline};
    use crate::cancellation::CancellationToken;
    use crate::errors::BootstrapError;
    use crate::reporting::ReporterConfig;
    use crate::task::{dispatch, TaskReporting};
    use crate::testing::{CountingResolver, RecordingEmitter, ScriptedPrompt, TestEnvironment, TestRepository};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn reporting(emitter: &Arc<RecordingEmitter>) -> TaskReporting {
        TaskReporting::new(
            Arc::new(CountingResolver::new(emitter.clone())),
            Arc::new(CancellationToken::new()),
        )
        .with_config(ReporterConfig::fast())
    }

    async fn bootstrap(ctx: &mut BootstrapContext) -> Result<(), BootstrapError> {
        Pipeline::standard().run(ctx).await
    }

    #[tokio::test]
    async fn test_create_then_info() {
        let env = TestEnvironment::new();
        let location = env.location("repo");
        let emitter = Arc::new(RecordingEmitter::new());

        let (mut ctx, stdout, _) = env.context(&["at", &location, "create", "-plaintext"]);
        bootstrap(&mut ctx).await.unwrap();
        assert!(ctx.store.is_none());
        assert_eq!(dispatch(&mut ctx, &reporting(&emitter)).await.unwrap(), 0);
        ctx.close().unwrap();
        assert!(stdout.contents().starts_with("Welcome to stowage !"));

        let (mut ctx, stdout, _) = env.context(&["at", &location, "info"]);
        bootstrap(&mut ctx).await.unwrap();
        assert_eq!(dispatch(&mut ctx, &reporting(&emitter)).await.unwrap(), 0);
        let store = ctx.store.clone().unwrap();
        ctx.close().unwrap();

        let out = stdout.contents();
        assert!(!out.contains("Welcome"));
        assert!(out.contains(&format!("Location: {location}")));
        assert!(out.contains("Encryption: none"));
        assert!(store.is_closed());
        assert!(emitter.names().is_empty());
    }

    #[tokio::test]
    async fn test_check_is_reported() {
        let env = TestEnvironment::new();
        let repo = TestRepository::plaintext();
        let emitter = Arc::new(RecordingEmitter::new());

        let (mut ctx, stdout, _) = env.context(&["at", &repo.location(), "check"]);
        bootstrap(&mut ctx).await.unwrap();
        assert_eq!(dispatch(&mut ctx, &reporting(&emitter)).await.unwrap(), 0);
        ctx.close().unwrap();

        assert!(stdout.contents().contains("ok"));
        assert_eq!(emitter.names(), vec!["check".to_string()]);
    }

    #[tokio::test]
    async fn test_encrypted_unlock_with_env_passphrase() {
        let mut env = TestEnvironment::new();
        env.env.passphrase = Some("s3cret".into());
        let repo = TestRepository::encrypted("s3cret");

        let (mut ctx, _, _) = env.context(&["at", &repo.location(), "info"]);
        bootstrap(&mut ctx).await.unwrap();

        assert!(ctx.security.has_secret());
        let repository = ctx.repository.clone().unwrap();
        assert!(repository.has_secret());
        let store = ctx.store.clone().unwrap();

        ctx.close().unwrap();
        assert!(!ctx.security.has_secret());
        assert!(!repository.has_secret());
        assert!(store.is_closed());
        assert!(ctx.signals.as_ref().unwrap().is_stopped());
        assert!(ctx.profiler.as_ref().unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_encrypted_unlock_after_wrong_prompt() {
        let env = TestEnvironment::new();
        let repo = TestRepository::encrypted("s3cret");
        let prompt = Arc::new(ScriptedPrompt::new(["nope", "s3cret"]));

        let (ctx, _, _) = env.context(&["at", &repo.location(), "info"]);
        let mut ctx = ctx.with_prompt(prompt.clone());
        bootstrap(&mut ctx).await.unwrap();

        assert_eq!(prompt.prompts().len(), 2);
        assert!(ctx.security.has_secret());
        ctx.close().unwrap();
    }

    #[tokio::test]
    async fn test_wrong_env_passphrase_does_not_prompt() {
        let mut env = TestEnvironment::new();
        env.env.passphrase = Some("wrong".into());
        let repo = TestRepository::encrypted("s3cret");
        let prompt = Arc::new(ScriptedPrompt::new(["s3cret"]));

        let (ctx, _, _) = env.context(&["at", &repo.location(), "info"]);
        let mut ctx = ctx.with_prompt(prompt.clone());
        let err = bootstrap(&mut ctx).await.unwrap_err();

        assert_eq!(err.to_string(), "bootstrap stage \"repository\" failed: failed to unlock repository");
        assert!(prompt.prompts().is_empty());
        let store = ctx.store.clone().unwrap();
        ctx.close().unwrap();
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_security_check_toggle_round_trip() {
        let env = TestEnvironment::new();

        let (mut ctx, stdout, _) = env.context(&["-disable-security-check"]);
        bootstrap(&mut ctx).await.unwrap();
        assert!(ctx.should_exit());
        assert_eq!(ctx.exit_code(), 1);
        assert!(ctx.profiler.is_none());
        assert!(stdout.contents().contains("security check disabled !"));
        assert!(env.cookies().is_disabled_security_check());
        ctx.close().unwrap();

        let (mut ctx, stdout, _) = env.context(&["-enable-security-check"]);
        bootstrap(&mut ctx).await.unwrap();
        assert_eq!(ctx.exit_code(), 1);
        assert!(stdout.contents().contains("security check enabled !"));
        assert!(!env.cookies().is_disabled_security_check());
        ctx.close().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_cpu_stops_before_later_stages() {
        let env = TestEnvironment::new();
        for cpu in ["0", "99"] {
            let (mut ctx, _, _) = env.context(&["-cpu", cpu, "version"]);
            let err = bootstrap(&mut ctx).await.unwrap_err();

            assert!(err.to_string().starts_with("bootstrap stage \"config\" failed"));
            assert_eq!(err.exit_code(), 1);
            assert!(ctx.profiler.is_none());
            assert!(ctx.signals.is_none());
            assert!(env.cookies().is_first_run());
            ctx.close().unwrap();
        }
    }

    #[tokio::test]
    async fn test_version_rejects_at_syntax() {
        let env = TestEnvironment::new();
        let location = env.location("repo");
        let (mut ctx, _, _) = env.context(&["at", &location, "version"]);

        let err = bootstrap(&mut ctx).await.unwrap_err();
        assert!(matches!(err.root(), BootstrapError::AtSyntaxNotAllowed(name) if name == "version"));
        assert!(ctx.signals.is_none());
        ctx.close().unwrap();
    }

    #[tokio::test]
    async fn test_missing_repository_has_hint() {
        let env = TestEnvironment::new();
        let location = env.location("missing");
        let (mut ctx, _, _) = env.context(&["at", &location, "info"]);

        let err = bootstrap(&mut ctx).await.unwrap_err();
        assert!(err.to_string().contains(&location));
        assert!(err.hint().unwrap().contains("stowage at <location> <command>"));
        assert!(ctx.store.is_none());
        ctx.close().unwrap();
    }

    #[tokio::test]
    async fn test_version_runs_without_repository() {
        let env = TestEnvironment::new();
        let emitter = Arc::new(RecordingEmitter::new());
        let (mut ctx, stdout, _) = env.context(&["version"]);

        bootstrap(&mut ctx).await.unwrap();
        assert!(ctx.repository.is_none());
        assert_eq!(dispatch(&mut ctx, &reporting(&emitter)).await.unwrap(), 0);
        ctx.close().unwrap();
        assert!(stdout.contents().lines().any(|l| l.starts_with("stowage/")));
    }

    #[tokio::test]
    async fn test_command_parse_error_is_returned() {
        let env = TestEnvironment::new();
        let emitter = Arc::new(RecordingEmitter::new());
        let (mut ctx, _, _) = env.context(&["version", "-bogus"]);

        bootstrap(&mut ctx).await.unwrap();
        assert!(dispatch(&mut ctx, &reporting(&emitter)).await.is_err());
        ctx.close().unwrap();
    }
}
