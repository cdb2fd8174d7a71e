use futures_util::{stream, StreamExt};

use crate::llm::TokenStream;

/// Tokens joined into one HTTP chunk on `/chat`.
pub const CHAT_BATCH_SIZE: usize = 3;

struct BatchState {
    tokens: TokenStream,
    buffer: Vec<String>,
    batch_size: usize,
    pending_error: Option<anyhow::Error>,
    done: bool,
}

/// Groups consecutive tokens into chunks of `batch_size`, flushing the tail
/// when the input ends. An upstream error is yielded after the tokens that
/// preceded it and terminates the output.
pub fn batch_tokens(tokens: TokenStream, batch_size: usize) -> TokenStream {
    let state = BatchState {
        tokens,
        buffer: Vec::with_capacity(batch_size.max(1)),
        batch_size: batch_size.max(1),
        pending_error: None,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if let Some(err) = state.pending_error.take() {
            return Some((Err(err), state));
        }
        if state.done {
            return None;
        }

        loop {
            match state.tokens.next().await {
                Some(Ok(token)) => {
                    state.buffer.push(token);
                    if state.buffer.len() >= state.batch_size {
                        let chunk = state.buffer.concat();
                        state.buffer.clear();
                        return Some((Ok(chunk), state));
                    }
                }
                Some(Err(err)) => {
                    state.done = true;
                    if state.buffer.is_empty() {
                        return Some((Err(err), state));
                    }
                    state.pending_error = Some(err);
                    let chunk = state.buffer.concat();
                    state.buffer.clear();
                    return Some((Ok(chunk), state));
                }
                None => {
                    state.done = true;
                    if state.buffer.is_empty() {
                        return None;
                    }
                    let chunk = state.buffer.concat();
                    state.buffer.clear();
                    return Some((Ok(chunk), state));
                }
            }
        }
    }))
}
