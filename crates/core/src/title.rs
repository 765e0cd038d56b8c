//! Thread title generation.
//!
//! Runs outside the turn, fire-and-forget, on the cheap model. Only fires
//! for threads whose title is still autogenerated; failures are logged and
//! the placeholder title simply stays.

use std::sync::Arc;

use sp_domain::config::RuntimeConfig;
use sp_domain::error::Result;
use sp_domain::thread::Message;
use sp_providers::ChatRequest;
use sp_store::Capability;

use crate::arbiter::LeaseOutcome;
use crate::CoreRuntime;

const PREVIEW_CHARS: usize = 200;
const MAX_TITLE_CHARS: usize = 50;

pub(crate) fn spawn_title_generation(
    runtime: Arc<CoreRuntime>,
    thread_id: String,
    first_message: String,
) {
    tokio::spawn(async move {
        if let Err(e) = generate_and_apply(&runtime, &thread_id, &first_message).await {
            tracing::warn!(error = %e, thread_id = %thread_id, "title generation failed");
        }
    });
}

async fn generate_and_apply(
    runtime: &Arc<CoreRuntime>,
    thread_id: &str,
    first_message: &str,
) -> Result<()> {
    let Some(mut thread) = runtime.threads.get(thread_id).await? else {
        return Ok(());
    };
    if !thread.title_is_autogenerated {
        return Ok(());
    }

    let spec = runtime.config.models.fast_model.clone();
    let (provider_id, model) = RuntimeConfig::split_model_spec(&spec);

    let lease = match runtime
        .arbiter
        .lease(thread.owner.id(), provider_id, Capability::Text)
        .await?
    {
        LeaseOutcome::Granted(lease) => lease,
        // No credential or no headroom: keep the placeholder title.
        _ => return Ok(()),
    };

    let preview: String = first_message.chars().take(PREVIEW_CHARS).collect();
    let prompt = format!(
        "Generate a concise title (3-8 words) for a conversation that starts \
         with the user message below. Return only the title, nothing else.\n\n\
         User message: {preview}"
    );

    let req = ChatRequest {
        messages: vec![Message::user(thread_id, prompt)],
        tools: Vec::new(),
        temperature: Some(0.7),
        max_tokens: Some(20),
        model: model.to_string(),
    };

    // A failed titling call hands its quota reservation back.
    let called = match runtime.providers.build(&lease) {
        Ok(provider) => provider.chat(&req).await,
        Err(e) => Err(e),
    };
    let resp = match called {
        Ok(resp) => resp,
        Err(e) => {
            if let Err(re) = runtime
                .arbiter
                .refund(thread.owner.id(), &lease, Capability::Text)
                .await
            {
                tracing::warn!(error = %re, "title quota refund failed");
            }
            return Err(e);
        }
    };

    if let Err(e) = runtime
        .arbiter
        .settle(thread.owner.id(), &lease, model, Capability::Text, resp.usage.as_ref())
        .await
    {
        tracing::warn!(error = %e, "title usage settlement failed");
    }

    let Some(title) = sanitize_title(&resp.content) else {
        return Ok(());
    };

    // Re-read in case the user renamed the thread while we were generating.
    let Some(current) = runtime.threads.get(thread_id).await? else {
        return Ok(());
    };
    if !current.title_is_autogenerated {
        return Ok(());
    }
    thread = current;
    thread.title = title;
    thread.updated_at = chrono::Utc::now();
    runtime.threads.update(&thread).await
}

/// Clean a model-produced title: first line only, quotes and trailing
/// punctuation stripped, length capped. `None` when nothing usable remains.
pub fn sanitize_title(raw: &str) -> Option<String> {
    let line = raw.lines().next().unwrap_or("");
    let mut title = line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_string();

    if title.is_empty() {
        return None;
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        title = title.chars().take(MAX_TITLE_CHARS - 3).collect::<String>() + "...";
    }
    Some(title)
}
