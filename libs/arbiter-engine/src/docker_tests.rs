/// Integration tests for the Docker sandbox
///
/// These tests verify the production execution path end to end:
/// 1. Every built-in language runs a fixed-output program
/// 2. Multi-case C++ compiles once and passes every case
/// 3. Syntax errors surface as COMPILATION_ERROR with nothing run
/// 4. Infinite loops are cut off close to the time limit, and `run`
///    returns within 500ms of it
/// 5. Verdicts are stable across repeated runs

#[cfg(test)]
mod docker_sandbox_tests {
    use crate::config::SandboxConfig;
    use crate::docker::DockerSandbox;
    use crate::executor::TestCaseExecutor;
    use crate::languages::LanguageRegistry;
    use crate::sandbox::{CompileOutput, ResourceLimits, RunStatus, SandboxBackend};
    use arbiter_common::types::{CaseError, ExecutionRequest, TestCase, Verdict};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn executor() -> TestCaseExecutor {
        let config = SandboxConfig::default();
        let sandbox = DockerSandbox::connect(&config).expect("Failed to connect to Docker");
        TestCaseExecutor::new(
            Arc::new(sandbox),
            Arc::new(LanguageRegistry::builtin()),
            config.compile_memory_mb,
        )
    }

    fn request(language: &str, source: &str, cases: Vec<TestCase>) -> ExecutionRequest {
        ExecutionRequest {
            source_code: source.to_string(),
            language: language.to_string(),
            test_cases: cases,
            problem_id: None,
        }
    }

    const CPP_SUM: &str = r#"
#include <iostream>
int main() {
    long long a, b;
    std::cin >> a >> b;
    std::cout << a + b << std::endl;
    return 0;
}
"#;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_ping() {
        let sandbox = DockerSandbox::connect(&SandboxConfig::default()).unwrap();
        sandbox.ping().await.expect("Docker daemon should answer");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_fixed_output_every_language() {
        let programs = [
            ("c", "#include <stdio.h>\nint main(){puts(\"ok\");return 0;}\n"),
            ("cpp", "#include <iostream>\nint main(){std::cout<<\"ok\\n\";}\n"),
            (
                "java",
                "public class Main { public static void main(String[] a) { System.out.println(\"ok\"); } }\n",
            ),
            ("python", "print('ok')\n"),
            ("javascript", "console.log('ok');\n"),
            ("rust", "fn main() { println!(\"ok\"); }\n"),
        ];

        let exec = executor();
        for (language, source) in programs {
            let summary = exec
                .execute(&request(language, source, vec![TestCase::new("", "ok")]), language)
                .await
                .unwrap_or_else(|e| panic!("{} failed to execute: {}", language, e));
            assert_eq!(
                summary.overall_result,
                Verdict::Accepted,
                "{} should be accepted: {:?}",
                language,
                summary
            );
        }
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_cpp_sum_accepted() {
        let req = request(
            "cpp",
            CPP_SUM,
            vec![TestCase::new("5 3", "8"), TestCase::new("-4 10\n", "6\n")],
        );

        let summary = executor().execute(&req, "cpp-sum").await.unwrap();

        assert_eq!(summary.overall_result, Verdict::Accepted);
        assert_eq!(summary.passed_tests, 2);
        assert_eq!(summary.total_tests, 2);
        assert!(summary.success);
        for outcome in &summary.results {
            assert!(outcome.memory_used_kb > 0, "peak memory should be reported");
        }
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_syntax_error_is_compilation_error() {
        let req = request(
            "cpp",
            "int main() { return 0 }",
            vec![TestCase::new("", ""), TestCase::new("", "")],
        );

        let summary = executor().execute(&req, "cpp-ce").await.unwrap();

        assert_eq!(summary.overall_result, Verdict::CompilationError);
        assert_eq!(summary.passed_tests, 0);
        assert!(summary.results.is_empty());
        assert!(!summary.compile_error.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_python_syntax_error_is_compilation_error() {
        let req = request("python", "print('unterminated\n", vec![TestCase::new("", "")]);
        let summary = executor().execute(&req, "py-ce").await.unwrap();
        assert_eq!(summary.overall_result, Verdict::CompilationError);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_infinite_loop_times_out() {
        let mut case = TestCase::new("", "never");
        case.time_limit_ms = Some(1000);
        let req = request("cpp", "int main() { for (;;) {} }", vec![case]);

        let exec = executor();
        let started = Instant::now();
        let summary = exec.execute(&req, "cpp-tle").await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(summary.overall_result, Verdict::TimeLimitExceeded);
        assert_eq!(summary.results[0].error_kind, Some(CaseError::TimeLimitExceeded));
        assert!(summary.results[0].execution_time_ms <= 1500);
        // Compile plus container start overhead on top of the limit.
        assert!(elapsed < Duration::from_secs(30));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_timed_out_run_returns_within_margin() {
        let config = SandboxConfig::default();
        let sandbox = DockerSandbox::connect(&config).unwrap();
        let registry = LanguageRegistry::builtin();
        let cpp = registry.resolve("cpp").unwrap();

        let workspace = sandbox.create_workspace("tle-bound").await.unwrap();
        let compiled = sandbox
            .compile(
                &workspace,
                &cpp,
                "int main() { for (;;) {} }",
                &ResourceLimits::for_compile(&cpp, config.compile_memory_mb),
            )
            .await
            .unwrap();
        assert_eq!(compiled, CompileOutput::Success);

        let limits = ResourceLimits::for_case(&cpp, Some(1000), None);
        let started = Instant::now();
        let output = sandbox.run(&workspace, &cpp, "", &limits).await.unwrap();
        let returned_after = started.elapsed();
        sandbox.destroy_workspace(&workspace).await.unwrap();

        assert_eq!(output.status, RunStatus::TimedOut);
        // Measured from container start to the moment run() hands back.
        assert!(
            output.elapsed_ms <= limits.time_limit_ms + 500,
            "returned {}ms after start",
            output.elapsed_ms
        );
        // Container create/attach/start happen before the clock starts.
        assert!(returned_after < Duration::from_millis(limits.time_limit_ms + 500 + 3_000));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_non_zero_exit_is_runtime_error() {
        let req = request(
            "python",
            "import sys\nsys.exit(3)\n",
            vec![TestCase::new("", "")],
        );
        let summary = executor().execute(&req, "py-re").await.unwrap();
        assert_eq!(summary.overall_result, Verdict::RuntimeError);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_memory_hog_is_memory_limit_exceeded() {
        let mut case = TestCase::new("", "");
        case.memory_limit_mb = Some(64);
        let req = request(
            "python",
            "chunks = []\nwhile True:\n    chunks.append(bytearray(16 * 1024 * 1024))\n",
            vec![case],
        );
        let summary = executor().execute(&req, "py-mle").await.unwrap();
        assert_eq!(summary.overall_result, Verdict::MemoryLimitExceeded);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_network_is_disabled() {
        let source = r#"
import socket
try:
    socket.create_connection(("1.1.1.1", 53), timeout=2)
    print("connected")
except OSError:
    print("blocked")
"#;
        let req = request("python", source, vec![TestCase::new("", "blocked")]);
        let summary = executor().execute(&req, "py-net").await.unwrap();
        assert_eq!(summary.overall_result, Verdict::Accepted);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_repeated_runs_are_idempotent() {
        let req = request("cpp", CPP_SUM, vec![TestCase::new("1 2", "3"), TestCase::new("2 2", "5")]);
        let exec = executor();

        let first = exec.execute(&req, "cpp-idem-1").await.unwrap();
        let second = exec.execute(&req, "cpp-idem-2").await.unwrap();

        assert_eq!(first.overall_result, Verdict::WrongAnswer);
        assert_eq!(first.overall_result, second.overall_result);
        assert_eq!(first.passed_tests, second.passed_tests);
    }
}
