//! The delivery pipelines of the trivia game.
//!
//! Every blueprint takes its configuration explicitly and validates it
//! before building.

use crate::config::PipelineConfig;
use crate::deploy::{template_file_name, EnvironmentKind};
use crate::errors::ShipflowError;
use crate::pipeline::{ActionSpec, Pipeline, PipelineBuilder, StageSpec};

/// Change-set name shared by every deploy stage.
pub const CHANGE_SET_NAME: &str = "StagedChangeSet";

/// Stack and template prefix of the backend service.
pub const BACKEND_STACK_PREFIX: &str = "TriviaBackend";

/// Build project rendering the backend templates.
pub const BACKEND_BUILD_PROJECT: &str = "trivia-backend/cdk/buildspec.yml";

/// Build project producing the backend base image.
pub const BASE_IMAGE_BUILD_PROJECT: &str = "trivia-backend/base/buildspec.yml";

/// Build project deploying the chat-bot language model.
pub const LEX_BOT_BUILD_PROJECT: &str = "chat-bot/lex-model/buildspec.yml";

const SOURCE_ARTIFACT: &str = "Source";
const BUILD_ARTIFACT: &str = "Build";

fn repository_source(config: &PipelineConfig) -> ActionSpec {
    ActionSpec::repository_source("GitHubSource", &config.repo_owner, &config.repo_name, "master")
        .with_output(SOURCE_ARTIFACT)
}

/// Plan at `first_order`, execute right after. Production stages are
/// preceded by an approval at `first_order - 1`.
fn deploy_stage(
    config: &PipelineConfig,
    kind: EnvironmentKind,
    stack_prefix: &str,
    template_prefix: &str,
) -> Result<StageSpec, ShipflowError> {
    let environment = config.environment(kind, stack_prefix)?;
    let template = template_file_name(template_prefix, kind);

    let (stage, create_id, execute_id, first_order) = match kind {
        EnvironmentKind::Test => (
            StageSpec::new("Test"),
            "PrepareChangesTest",
            "ExecuteChangesTest",
            1,
        ),
        EnvironmentKind::Prod => (
            StageSpec::new("Prod").with_action(
                ActionSpec::approval("Approve")
                    .with_message(format!("Promote to {}?", environment.stack_name)),
            ),
            "PrepareChanges",
            "ExecuteChangesProd",
            2,
        ),
    };

    Ok(stage
        .with_action(
            ActionSpec::create_change_set(create_id, environment.clone(), CHANGE_SET_NAME, template)
                .with_input(BUILD_ARTIFACT)
                .with_run_order(first_order),
        )
        .with_action(
            ActionSpec::execute_change_set(execute_id, environment, CHANGE_SET_NAME)
                .with_run_order(first_order + 1),
        ))
}

/// The backend service: source and base image, one build rendering both
/// templates, a test deploy, and an approval-gated production deploy.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn api_service(config: &PipelineConfig) -> Result<Pipeline, ShipflowError> {
    config.validate()?;
    let service = &config.service;

    let pipeline = PipelineBuilder::new("reinvent-trivia-game-trivia-backend-cfn-deploy")
        .stage(
            StageSpec::new("Source")
                .with_action(repository_source(config))
                .with_action(
                    ActionSpec::image_source(
                        "BaseImage",
                        &service.base_image_repository,
                        &service.base_image_tag,
                    )
                    .with_output("BaseImage"),
                ),
        )
        .stage(
            StageSpec::new("Build").with_action(
                ActionSpec::build("CodeBuild", BACKEND_BUILD_PROJECT)
                    .with_input(SOURCE_ARTIFACT)
                    .with_additional_input("BaseImage")
                    .with_output(BUILD_ARTIFACT),
            ),
        )
        .stage(deploy_stage(config, EnvironmentKind::Test, BACKEND_STACK_PREFIX, BACKEND_STACK_PREFIX)?)
        .stage(deploy_stage(config, EnvironmentKind::Prod, BACKEND_STACK_PREFIX, BACKEND_STACK_PREFIX)?)
        .build()?;
    Ok(pipeline)
}

/// Builds the backend base image.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn base_image(config: &PipelineConfig) -> Result<Pipeline, ShipflowError> {
    config.validate()?;
    let pipeline = PipelineBuilder::new("reinvent-trivia-game-base-image")
        .stage(StageSpec::new("Source").with_action(repository_source(config)))
        .stage(
            StageSpec::new("Build").with_action(
                ActionSpec::build("CodeBuild", BASE_IMAGE_BUILD_PROJECT).with_input(SOURCE_ARTIFACT),
            ),
        )
        .build()?;
    Ok(pipeline)
}

/// Parameters of a template-deploying pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfnPipelineProps {
    /// Short pipeline name, e.g. `chat-bot`.
    pub pipeline_name: String,
    /// Stack name stem, e.g. `ChatBot`.
    pub stack_name: String,
    /// Template file stem, e.g. `ChatBot`.
    pub template_name: String,
    /// Directory holding the build spec.
    pub directory: String,
}

impl CfnPipelineProps {
    /// Creates the props.
    #[must_use]
    pub fn new(
        pipeline_name: impl Into<String>,
        stack_name: impl Into<String>,
        template_name: impl Into<String>,
        directory: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            stack_name: stack_name.into(),
            template_name: template_name.into(),
            directory: directory.into(),
        }
    }

    /// Full pipeline name.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("reinvent-trivia-game-{}", self.pipeline_name)
    }

    /// Prefix of the test and prod stack names.
    #[must_use]
    pub fn stack_prefix(&self) -> String {
        format!("TriviaGame{}", self.stack_name)
    }

    /// Build project of the pipeline.
    #[must_use]
    pub fn build_project(&self) -> String {
        format!("{}/buildspec.yml", self.directory)
    }
}

/// Source, build, test and gated prod deploy of a template-only project.
///
/// Returns the builder so callers can append stages.
///
/// # Errors
///
/// Returns an error if the configuration or the derived stack names are invalid.
pub fn cfn_pipeline(
    config: &PipelineConfig,
    props: &CfnPipelineProps,
) -> Result<PipelineBuilder, ShipflowError> {
    config.validate()?;
    let stack_prefix = props.stack_prefix();

    Ok(PipelineBuilder::new(props.full_name())
        .stage(StageSpec::new("Source").with_action(repository_source(config)))
        .stage(
            StageSpec::new("Build").with_action(
                ActionSpec::build("CodeBuild", props.build_project())
                    .with_input(SOURCE_ARTIFACT)
                    .with_output(BUILD_ARTIFACT),
            ),
        )
        .stage(deploy_stage(config, EnvironmentKind::Test, &stack_prefix, &props.template_name)?)
        .stage(deploy_stage(config, EnvironmentKind::Prod, &stack_prefix, &props.template_name)?))
}

/// Infrastructure of the static site.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn static_site_infra(config: &PipelineConfig) -> Result<Pipeline, ShipflowError> {
    let props = CfnPipelineProps::new("static-site-infra", "StaticSiteInfra", "StaticSiteInfra", "static-site/cdk");
    Ok(cfn_pipeline(config, &props)?.build()?)
}

/// The chat bot, plus a final stage deploying its language model from source.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn chat_bot(config: &PipelineConfig) -> Result<Pipeline, ShipflowError> {
    let props = CfnPipelineProps::new("chat-bot", "ChatBot", "ChatBot", "chat-bot");
    Ok(cfn_pipeline(config, &props)?
        .stage(
            StageSpec::new("DeployLexBot").with_action(
                ActionSpec::build("Deploy", LEX_BOT_BUILD_PROJECT).with_input(SOURCE_ARTIFACT),
            ),
        )
        .build()?)
}
